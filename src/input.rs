//! Provides a means to read, parse and hold configuration options for scans.
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;

use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde_derive::Deserialize;

use crate::address::{UnitPlan, DEFAULT_MAX_HOSTS};
use crate::error::ConfigError;
use crate::model::Protocol;
use crate::notify::telegram::TelegramConfig;
use crate::port_strategy::PortStrategy;
use crate::services::common_ports;
use crate::tui::OutputFormat;

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

/// Represents the strategy in which the port scanning will run.
///   - Serial will run from start to end, for example 1 to 1_000.
///   - Random will randomize the order in which ports will be scanned.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    Serial,
    Random,
}

pub type Ports = Vec<u16>;

/// Parses `80,443,1-1000` style port lists into sorted, unique ports.
pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => ports.extend(parse_port_range(part, start, end)?),
            None => ports.push(parse_single_port(part)?),
        }
    }

    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

fn parse_port_range(range: &str, start: &str, end: &str) -> Result<Vec<u16>, String> {
    if end.contains('-') {
        return Err(format!(
            "Invalid range format '{range}'. Expected 'start-end'. Example: 1-1000.",
        ));
    }

    let start: u16 = start
        .trim()
        .parse()
        .map_err(|_| format!("Invalid start port '{start}' in range '{range}'"))?;
    let end: u16 = end
        .trim()
        .parse()
        .map_err(|_| format!("Invalid end port '{end}' in range '{range}'"))?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range}'",
        ));
    }
    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port: &str) -> Result<u16, String> {
    let parsed: u16 = port
        .parse()
        .map_err(|_| format!("Invalid port number '{port}'"))?;

    if parsed < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {parsed} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(parsed)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "reconwatch",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// Network reconnaissance scanner with Telegram alerting.
/// Only scan networks you are authorised to test.
pub struct Opts {
    /// A comma-delimited list or newline-delimited file of separated CIDRs, IPs, or hosts to be scanned.
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// A list of ports and/or port ranges to be scanned. Examples: 80,443,8080 or 1-1000 or 1-1000,8080
    #[arg(short, long, alias = "range", value_parser = parse_ports_and_ranges, conflicts_with = "top")]
    pub ports: Option<Ports>,

    /// Scan the built-in list of common service ports. This is also the
    /// default when no ports are given.
    #[arg(long)]
    pub top: bool,

    /// Whether to ignore the configuration file or not.
    #[arg(short, long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(short, long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Greppable mode. Only output `ip -> [ports]` lines.
    #[arg(short, long)]
    pub greppable: bool,

    /// Print all reports as JSON.
    #[arg(long, conflicts_with = "greppable")]
    pub json: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// Number of probes in flight at once. Depends on the open file limit
    /// of your OS.
    #[arg(short, long, default_value = "500")]
    pub workers: usize,

    /// Maximum probes started per second.
    #[arg(short, long, default_value = "1000")]
    pub rate: u32,

    /// Probes that may start back to back before the rate applies.
    #[arg(long, default_value = "50")]
    pub burst: u32,

    /// Refuse sessions with more scan units than this.
    #[arg(long)]
    pub max_backlog: Option<usize>,

    /// Largest number of hosts the targets may expand to.
    #[arg(long, default_value_t = DEFAULT_MAX_HOSTS)]
    pub max_hosts: usize,

    /// The timeout in milliseconds before a port is assumed to be filtered.
    #[arg(short, long, default_value = "1500")]
    pub timeout: u32,

    /// How long to wait for a service banner, in milliseconds.
    #[arg(long, default_value = "500")]
    pub banner_timeout: u32,

    /// Do not read service banners from open ports.
    #[arg(long)]
    pub no_banner_grab: bool,

    /// The number of tries before a port is assumed to be filtered.
    /// If set to 0, it is corrected to 1.
    #[arg(long, default_value = "1")]
    pub tries: u8,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,

    /// The order of scanning to be performed. The "serial" option will
    /// scan ports in ascending order while the "random" option will scan
    /// ports randomly.
    #[arg(long, value_enum, ignore_case = true, default_value = "serial")]
    pub scan_order: ScanOrder,

    /// A list of comma separated ports to be excluded from scanning. Example: 80,443,8080.
    #[arg(short, long, value_delimiter = ',')]
    pub exclude_ports: Option<Vec<u16>>,

    /// A list of comma separated CIDRs, IPs, or hosts to be excluded from scanning.
    #[arg(short = 'x', long = "exclude-addresses", value_delimiter = ',')]
    pub exclude_addresses: Option<Vec<String>>,

    /// UDP scanning mode, finds UDP ports that send back responses
    #[arg(long)]
    pub udp: bool,

    /// Send an ICMP echo to every host. Needs raw socket privileges.
    #[arg(long)]
    pub ping: bool,

    /// Keep rescanning and report changes instead of scanning once.
    #[arg(short, long)]
    pub monitor: bool,

    /// Seconds between monitoring rounds.
    #[arg(long, default_value = "300")]
    pub interval: u64,

    /// Telegram bot token, as issued by BotFather.
    #[arg(long, env = "RECONWATCH_TELEGRAM_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,

    /// Telegram chat that receives the notifications.
    #[arg(long, env = "RECONWATCH_TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<String>,

    /// Also notify reports without open ports.
    #[arg(long)]
    pub notify_empty: bool,

    /// Check the Telegram settings by sending a test message, then exit.
    #[arg(long)]
    pub test_telegram: bool,

    /// Arguments given on the command line or through the environment.
    /// The configuration file never overrides them.
    #[arg(skip)]
    explicit: HashSet<String>,
}

/// Validated settings of a scan run.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub workers: NonZeroUsize,
    pub rate: NonZeroU32,
    pub burst: NonZeroU32,
    pub max_backlog: Option<usize>,
    pub max_hosts: usize,
    pub timeout: Duration,
    pub banner_timeout: Duration,
    pub tries: u8,
    pub grab_banners: bool,
    pub plan: UnitPlan,
    pub output: OutputFormat,
    pub telegram: Option<TelegramConfig>,
    /// Monitoring interval, `None` for a single scan.
    pub interval: Option<Duration>,
}

#[cfg(not(tarpaulin_include))]
impl Opts {
    pub fn read() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Like [`Opts::read`], over the given arguments instead of the
    /// process's own.
    pub fn read_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;
        Ok(Self::from_matches(&matches))
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        let mut opts = Self::from_arg_matches(matches).unwrap_or_else(|e| e.exit());
        opts.explicit = matches
            .ids()
            .filter(|id| {
                matches!(
                    matches.value_source(id.as_str()),
                    Some(ValueSource::CommandLine | ValueSource::EnvVariable)
                )
            })
            .map(|id| id.as_str().to_owned())
            .collect();
        opts
    }

    /// Whether `field` was set on the command line or in the environment.
    fn given(&self, field: &str) -> bool {
        self.explicit.contains(field)
    }

    /// Fills the options the user did not give on the command line with
    /// values found within the user configuration file.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        if !self.given(stringify!($field)) {
                            self.$field = e.clone();
                        }
                    }
                )+
            }
        }

        merge_required!(
            addresses, greppable, json, accessible, workers, rate, burst, timeout,
            banner_timeout, tries, scan_order, udp, ping, interval, notify_empty
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if self.$field.is_none() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // Only use the common ports when the user asks for them
        if self.top {
            self.ports = Some(common_ports());
        }

        merge_optional!(
            ports, resolver, ulimit, max_backlog, exclude_ports, exclude_addresses,
            telegram_token, telegram_chat_id
        );
    }

    /// Validates the options into the settings of a run.
    pub fn scan_config(&self) -> Result<ScanConfig, ConfigError> {
        let workers = NonZeroUsize::new(self.workers).ok_or(ConfigError::InvalidPoolSize)?;
        let rate = NonZeroU32::new(self.rate).ok_or(ConfigError::InvalidRate)?;
        let burst = NonZeroU32::new(self.burst).ok_or(ConfigError::InvalidRate)?;

        let ports = self.ports.clone().unwrap_or_else(common_ports);
        let ports = PortStrategy::pick(
            &ports,
            self.exclude_ports.as_deref().unwrap_or_default(),
            self.scan_order,
        );
        if ports.is_empty() {
            return Err(ConfigError::NoPorts);
        }
        let protocol = if self.udp { Protocol::Udp } else { Protocol::Tcp };

        let telegram = match (&self.telegram_token, &self.telegram_chat_id) {
            (Some(token), Some(chat_id)) => Some(TelegramConfig::new(token, chat_id)?),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTelegram),
        };

        let interval = if self.monitor {
            if self.interval == 0 {
                return Err(ConfigError::InvalidInterval);
            }
            Some(Duration::from_secs(self.interval))
        } else {
            None
        };

        let output = if self.json {
            OutputFormat::Json
        } else if self.greppable {
            OutputFormat::Greppable
        } else {
            OutputFormat::Human
        };

        Ok(ScanConfig {
            workers,
            rate,
            burst,
            max_backlog: self.max_backlog,
            max_hosts: self.max_hosts,
            timeout: Duration::from_millis(self.timeout.into()),
            banner_timeout: Duration::from_millis(self.banner_timeout.into()),
            tries: self.tries,
            grab_banners: !self.no_banner_grab,
            plan: UnitPlan {
                ports,
                protocols: vec![protocol],
                ping: self.ping,
            },
            output,
            telegram,
            interval,
        })
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: vec![],
            ports: None,
            top: false,
            no_config: true,
            config_path: None,
            greppable: true,
            json: false,
            accessible: false,
            resolver: None,
            workers: 500,
            rate: 1000,
            burst: 50,
            max_backlog: None,
            max_hosts: DEFAULT_MAX_HOSTS,
            timeout: 0,
            banner_timeout: 0,
            no_banner_grab: false,
            tries: 0,
            ulimit: None,
            scan_order: ScanOrder::Serial,
            exclude_ports: None,
            exclude_addresses: None,
            udp: false,
            ping: false,
            monitor: false,
            interval: 300,
            telegram_token: None,
            telegram_chat_id: None,
            notify_empty: false,
            test_telegram: false,
            explicit: HashSet::new(),
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[cfg(not(tarpaulin_include))]
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    addresses: Option<Vec<String>>,
    ports: Option<Vec<u16>>,
    greppable: Option<bool>,
    json: Option<bool>,
    accessible: Option<bool>,
    workers: Option<usize>,
    rate: Option<u32>,
    burst: Option<u32>,
    max_backlog: Option<usize>,
    timeout: Option<u32>,
    banner_timeout: Option<u32>,
    tries: Option<u8>,
    ulimit: Option<u64>,
    resolver: Option<String>,
    scan_order: Option<ScanOrder>,
    exclude_ports: Option<Vec<u16>>,
    exclude_addresses: Option<Vec<String>>,
    udp: Option<bool>,
    ping: Option<bool>,
    interval: Option<u64>,
    notify_empty: Option<bool>,
    telegram_token: Option<String>,
    telegram_chat_id: Option<String>,
}

#[cfg(not(tarpaulin_include))]
#[allow(clippy::doc_link_with_quotes)]
impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct. A missing file is an empty configuration.
    ///
    /// # Format
    ///
    /// addresses = ["192.168.1.0/24", "gateway.lan"]
    /// ports = [22, 80, 443]
    /// workers = 200
    /// rate = 500
    /// scan_order = "Serial"
    /// interval = 600
    /// telegram_token = "123456:ABC-DEF"
    /// telegram_chat_id = "-1001234567"
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = custom_config_path.unwrap_or_else(default_config_path);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> PathBuf {
    let mut config_path = dirs::home_dir().unwrap_or_default();
    config_path.push(".reconwatch.toml");
    config_path
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use parameterized::parameterized;
    use std::time::Duration;

    use super::{parse_ports_and_ranges, Config, Opts, ScanOrder};
    use crate::error::ConfigError;
    use crate::model::Protocol;
    use crate::services::common_ports;
    use crate::tui::OutputFormat;

    fn config() -> Config {
        Config {
            addresses: Some(vec!["127.0.0.1".to_owned()]),
            greppable: Some(false),
            workers: Some(64),
            timeout: Some(1_000),
            tries: Some(2),
            accessible: Some(true),
            scan_order: Some(ScanOrder::Random),
            telegram_token: Some("42:from-file".to_owned()),
            telegram_chat_id: Some("-100".to_owned()),
            ..Config::default()
        }
    }

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn opts_no_merge_when_config_is_ignored() {
        let mut opts = Opts::default();

        opts.merge(&config());

        assert!(opts.addresses.is_empty());
        assert!(opts.greppable);
        assert!(!opts.accessible);
        assert_eq!(opts.workers, 500);
        assert_eq!(opts.telegram_token, None);
    }

    #[test]
    fn config_fills_options_not_given_on_the_command_line() {
        let mut opts = Opts::default();
        let config = config();

        opts.merge_required(&config);

        assert_eq!(opts.addresses, ["127.0.0.1"]);
        assert!(!opts.greppable);
        assert!(opts.accessible);
        assert_eq!(opts.workers, 64);
        assert_eq!(opts.timeout, 1_000);
        assert_eq!(opts.tries, 2);
        assert_eq!(opts.scan_order, ScanOrder::Random);
        assert_eq!(opts.rate, 1000);
    }

    #[test]
    fn opts_merge_optional_arguments() {
        let mut opts = Opts {
            telegram_token: Some("7:from-cli".to_owned()),
            ..Opts::default()
        };
        let config = Config {
            ports: Some(vec![22, 80]),
            ulimit: Some(1_000),
            resolver: Some("1.1.1.1".to_owned()),
            ..config()
        };

        opts.merge_optional(&config);

        assert_eq!(opts.ports, Some(vec![22, 80]));
        assert_eq!(opts.ulimit, Some(1_000));
        assert_eq!(opts.resolver.as_deref(), Some("1.1.1.1"));
        assert_eq!(opts.telegram_token.as_deref(), Some("7:from-cli"));
        assert_eq!(opts.telegram_chat_id.as_deref(), Some("-100"));
    }

    #[test]
    fn command_line_wins_over_config_file() {
        let mut opts =
            Opts::read_from(["reconwatch", "-w", "1000", "-p", "22", "-r", "50", "-a", "10.0.0.1"])
                .unwrap();
        let config = Config {
            addresses: Some(vec!["192.0.2.1".to_owned()]),
            ports: Some(vec![80]),
            workers: Some(200),
            rate: Some(5),
            timeout: Some(900),
            exclude_addresses: Some(vec!["10.0.0.0/8".to_owned()]),
            ..Config::default()
        };

        opts.merge(&config);

        assert_eq!(opts.workers, 1000);
        assert_eq!(opts.rate, 50);
        assert_eq!(opts.ports, Some(vec![22]));
        assert_eq!(opts.addresses, ["10.0.0.1"]);
        assert_eq!(opts.timeout, 900);
        assert_eq!(opts.exclude_addresses, Some(vec!["10.0.0.0/8".to_owned()]));
    }

    #[test]
    fn explicit_flag_equal_to_default_still_wins() {
        let mut opts = Opts::read_from(["reconwatch", "-a", "10.0.0.1", "-w", "500"]).unwrap();
        let config = Config {
            workers: Some(64),
            burst: Some(10),
            ..Config::default()
        };

        opts.merge(&config);

        assert_eq!(opts.workers, 500);
        assert_eq!(opts.burst, 10);
    }

    #[test]
    fn top_overrides_configured_ports() {
        let mut opts = Opts {
            top: true,
            ..Opts::default()
        };
        let config = Config {
            ports: Some(vec![1, 2, 3]),
            ..Config::default()
        };

        opts.merge_optional(&config);

        assert_eq!(opts.ports, Some(common_ports()));
    }

    #[test]
    fn config_file_is_parsed() {
        let config: Config = toml::from_str(
            r#"
            addresses = ["10.0.0.0/30"]
            ports = [22, 80]
            rate = 20
            scan_order = "Random"
            telegram_chat_id = "-42"
            "#,
        )
        .unwrap();

        assert_eq!(config.rate, Some(20));
        assert_eq!(config.scan_order, Some(ScanOrder::Random));
        assert_eq!(config.telegram_chat_id.as_deref(), Some("-42"));
    }

    #[test]
    fn missing_config_file_is_empty() {
        let path = std::env::temp_dir().join("reconwatch-no-such-config.toml");
        let config = Config::read(Some(path)).unwrap();
        assert!(config.addresses.is_none());
    }

    #[parameterized(input = {
        vec!["reconwatch", "-a", "10.0.0.1", "-w", "0"],
        vec!["reconwatch", "-a", "10.0.0.1", "-r", "0"],
        vec!["reconwatch", "-a", "10.0.0.1", "--burst", "0"],
        vec!["reconwatch", "-a", "10.0.0.1", "-p", "22", "-e", "22"],
        vec!["reconwatch", "-a", "10.0.0.1", "--telegram-chat-id", "-5"],
        vec!["reconwatch", "-a", "10.0.0.1", "--monitor", "--interval", "0"],
    }, expected = {
        "InvalidPoolSize",
        "InvalidRate",
        "InvalidRate",
        "NoPorts",
        "IncompleteTelegram",
        "InvalidInterval",
    })]
    fn invalid_settings_are_fatal(input: Vec<&str>, expected: &str) {
        let opts = Opts::parse_from(input);

        let error = opts.scan_config().unwrap_err();

        assert!(format!("{error:?}").starts_with(expected), "{error:?}");
    }

    #[test]
    fn defaults_scan_common_tcp_ports() {
        let opts = Opts::parse_from(["reconwatch", "-a", "10.0.0.1", "--telegram-token", "1:a", "--telegram-chat-id", "2"]);

        let config = opts.scan_config().unwrap();

        assert_eq!(config.plan.ports.len(), common_ports().len());
        assert_eq!(config.plan.protocols, [Protocol::Tcp]);
        assert!(!config.plan.ping);
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.output, OutputFormat::Human);
        assert_eq!(config.interval, None);
        assert_eq!(config.telegram.unwrap().chat_id, "2");
    }

    #[test]
    fn monitoring_udp_json_run() {
        let opts = Opts::parse_from([
            "reconwatch", "-a", "10.0.0.1", "-p", "53,161", "--udp", "--json", "--monitor",
            "--interval", "60", "--telegram-token", "1:a", "--telegram-chat-id", "2",
        ]);

        let config = opts.scan_config().unwrap();

        assert_eq!(config.plan.ports.ordered_iter().collect::<Vec<_>>(), [53, 161]);
        assert_eq!(config.plan.protocols, [Protocol::Udp]);
        assert_eq!(config.output, OutputFormat::Json);
        assert_eq!(config.interval, Some(Duration::from_secs(60)));
    }

    #[test]
    fn bot_prefixed_token_is_rejected() {
        let opts = Opts::parse_from([
            "reconwatch", "-a", "10.0.0.1", "--telegram-token", "bot1:a", "--telegram-chat-id", "2",
        ]);

        assert!(matches!(
            opts.scan_config(),
            Err(ConfigError::InvalidTelegramToken(_))
        ));
    }

    #[parameterized(input = {
        "80", "80,443,8080", "1-5", "80, 443, 1-3, 8080", "80,443,80,443",
    }, expected = {
        vec![80], vec![80, 443, 8080], vec![1, 2, 3, 4, 5], vec![1, 2, 3, 80, 443, 8080], vec![80, 443],
    })]
    fn parse_ports_and_ranges_valid(input: &str, expected: Vec<u16>) {
        assert_eq!(parse_ports_and_ranges(input), Ok(expected));
    }

    #[parameterized(input = {
        "", "80,abc,443", "80,1-abc,443", "80,1-2-3,443", "80,5-1,443", "80,70000,443", "80,0,443",
    }, message = {
        "No valid ports or ranges provided",
        "Invalid port number 'abc'",
        "Invalid end port 'abc' in range '1-abc'",
        "Invalid range format '1-2-3'",
        "Start port 5 is greater than end port 1 in range '5-1'",
        "Invalid port number '70000'",
        "Port 0 must be between 1 and 65535",
    })]
    fn parse_ports_and_ranges_invalid(input: &str, message: &str) {
        let error = parse_ports_and_ranges(input).unwrap_err();
        assert!(error.contains(message), "{error}");
    }
}
