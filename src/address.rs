//! Turns target specifications (IPs, CIDRs, hostnames or files of them)
//! into deduplicated [`Target`]s, and targets into [`ScanUnit`]s.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use cidr_utils::cidr::IpCidr;
use futures::stream::{self, StreamExt};
use hickory_resolver::{
    config::{NameServerConfig, Protocol as DnsProtocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use itertools::Itertools;
use log::{debug, warn};
use tokio::{fs, io};

use crate::error::ResolutionError;
use crate::model::{Protocol, ScanUnit, Target};
use crate::port_strategy::PortStrategy;

/// Default bound on the number of hosts a single session may expand to.
pub const DEFAULT_MAX_HOSTS: usize = 65_536;

type Host = (IpAddr, Option<String>);

/// Outcome of resolving a list of target specifications.
///
/// Failures are collected next to the successfully resolved targets,
/// one bad entry never aborts the others.
#[derive(Debug, Default)]
pub struct Resolution {
    pub targets: Vec<Arc<Target>>,
    pub errors: Vec<ResolutionError>,
}

/// Expands target specifications, bounded by a maximum host count.
pub struct TargetResolver {
    backup: Option<TokioAsyncResolver>,
    max_hosts: usize,
}

impl TargetResolver {
    /// A resolver that relies on the system's name resolution only.
    pub const fn new(max_hosts: usize) -> Self {
        Self {
            backup: None,
            max_hosts,
        }
    }

    /// A resolver falling back to the given DNS servers (or the system
    /// configuration, or Cloudflare) when the system lookup fails.
    pub async fn with_dns(max_hosts: usize, resolver: &Option<String>) -> Self {
        Self {
            backup: Some(get_resolver(resolver).await),
            max_hosts,
        }
    }

    /// Resolves every spec and removes the excluded addresses.
    ///
    /// Targets keep the order of the input; an address reached through
    /// several specs appears once, with the hostname it was first seen under.
    ///
    /// ```rust
    /// # use reconwatch::address::TargetResolver;
    /// # let runtime = tokio::runtime::Runtime::new().unwrap();
    /// let resolver = TargetResolver::new(1024);
    /// let resolution = runtime.block_on(resolver.resolve(&["192.168.0.0/30".to_owned()], &[]));
    /// assert_eq!(resolution.targets.len(), 4);
    /// ```
    pub async fn resolve(&self, specs: &[String], exclude: &[String]) -> Resolution {
        let expanded = stream::iter(specs)
            .map(|spec| self.expand(spec))
            .buffered(10)
            .collect::<Vec<_>>()
            .await;

        let excluded = self.exclusions(exclude).await;

        let mut resolution = Resolution::default();
        let mut seen: HashSet<IpAddr> = HashSet::new();

        for (spec, result) in expanded.into_iter().flatten() {
            let hosts = match result {
                Ok(hosts) => hosts,
                Err(e) => {
                    warn!("{e}");
                    resolution.errors.push(e);
                    continue;
                }
            };

            let fresh = hosts
                .into_iter()
                .filter(|(ip, _)| !excluded.contains(ip) && !seen.contains(ip))
                .unique_by(|(ip, _)| *ip)
                .collect::<Vec<_>>();

            if resolution.targets.len() + fresh.len() > self.max_hosts {
                let e = ResolutionError::FanOutExceeded {
                    spec,
                    hosts: (resolution.targets.len() + fresh.len()) as u128,
                    max: self.max_hosts,
                };
                warn!("{e}");
                resolution.errors.push(e);
                continue;
            }

            for (ip, hostname) in fresh {
                seen.insert(ip);
                resolution.targets.push(Arc::new(Target::new(ip, hostname)));
            }
        }

        debug!(
            "Resolved {} targets, {} specs failed",
            resolution.targets.len(),
            resolution.errors.len()
        );
        resolution
    }

    /// Parses the exclusions. Networks are kept as CIDRs and matched by
    /// containment, so their size is never bounded by `max_hosts`; only
    /// hostnames are resolved.
    async fn exclusions(&self, exclude: &[String]) -> Exclusions {
        let mut exclusions = Exclusions::default();
        for spec in exclude.iter().map(|spec| spec.trim()) {
            if let Ok(ip) = IpAddr::from_str(spec) {
                exclusions.hosts.insert(ip);
                continue;
            }
            match IpCidr::from_str(spec) {
                Ok(cidr) => exclusions.networks.push(cidr),
                Err(_) if looks_like_address(spec) || !is_valid_hostname(spec) => {
                    warn!("Ignoring exclusion {spec:?}: not an IP address, CIDR or hostname");
                }
                Err(_) => match self.resolve_host(spec).await {
                    Ok(hosts) => exclusions.hosts.extend(hosts.into_iter().map(|(ip, _)| ip)),
                    Err(e) => warn!("Ignoring exclusion: {e}"),
                },
            }
        }
        exclusions
    }

    /// Expands one spec. A readable file expands to one entry per line.
    async fn expand(&self, spec: &str) -> Vec<(String, Result<Vec<Host>, ResolutionError>)> {
        let spec = spec.trim();
        if Path::new(spec).is_file() {
            return match read_lines(spec).await {
                Ok(lines) => {
                    stream::iter(lines)
                        .map(|line| async move {
                            let result = self.expand_entry(&line).await;
                            (line, result)
                        })
                        .buffered(4)
                        .collect()
                        .await
                }
                Err(e) => vec![(
                    spec.to_owned(),
                    Err(ResolutionError::InvalidAddress {
                        spec: spec.to_owned(),
                        reason: format!("unreadable target file: {e}"),
                    }),
                )],
            };
        }

        vec![(spec.to_owned(), self.expand_entry(spec).await)]
    }

    /// Given a string, parse it as an IP address, CIDR or hostname.
    async fn expand_entry(&self, spec: &str) -> Result<Vec<Host>, ResolutionError> {
        if spec.is_empty() {
            return Err(ResolutionError::InvalidAddress {
                spec: spec.to_owned(),
                reason: "empty target".to_owned(),
            });
        }

        if let Ok(ip) = IpAddr::from_str(spec) {
            return Ok(vec![(ip, None)]);
        }

        match IpCidr::from_str(spec) {
            Ok(cidr) => self.expand_cidr(spec, &cidr),
            Err(e) if looks_like_address(spec) => Err(ResolutionError::InvalidAddress {
                spec: spec.to_owned(),
                reason: e.to_string(),
            }),
            Err(_) if !is_valid_hostname(spec) => Err(ResolutionError::InvalidAddress {
                spec: spec.to_owned(),
                reason: "not an IP address, CIDR or hostname".to_owned(),
            }),
            Err(_) => self.resolve_host(spec).await,
        }
    }

    fn expand_cidr(&self, spec: &str, cidr: &IpCidr) -> Result<Vec<Host>, ResolutionError> {
        let bits = if cidr.first_address().is_ipv4() { 32 } else { 128 };
        let host_bits = u32::from(bits - cidr.network_length());
        let hosts = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);

        if hosts > self.max_hosts as u128 {
            return Err(ResolutionError::FanOutExceeded {
                spec: spec.to_owned(),
                hosts,
                max: self.max_hosts,
            });
        }

        Ok(cidr.iter().map(|inet| (inet.address(), None)).collect())
    }

    /// Uses DNS to get the IPs associated with host.
    async fn resolve_host(&self, host: &str) -> Result<Vec<Host>, ResolutionError> {
        let name = Some(host.to_owned());

        if let Ok(addrs) = tokio::net::lookup_host((host, 80)).await {
            let ips = addrs
                .map(|addr| (addr.ip(), name.clone()))
                .unique_by(|(ip, _)| *ip)
                .collect_vec();
            if !ips.is_empty() {
                return Ok(ips);
            }
        }

        if let Some(backup) = &self.backup {
            if let Ok(lookup) = backup.lookup_ip(host).await {
                let ips = lookup
                    .iter()
                    .map(|ip| (ip, name.clone()))
                    .unique_by(|(ip, _)| *ip)
                    .collect_vec();
                if !ips.is_empty() {
                    return Ok(ips);
                }
            }
        }

        Err(ResolutionError::Dns {
            host: host.to_owned(),
        })
    }
}

/// Addresses removed from the expanded targets.
#[derive(Debug, Default)]
struct Exclusions {
    hosts: HashSet<IpAddr>,
    networks: Vec<IpCidr>,
}

impl Exclusions {
    fn contains(&self, ip: &IpAddr) -> bool {
        self.hosts.contains(ip) || self.networks.iter().any(|cidr| cidr.contains(ip))
    }
}

/// The ports, protocols and optional ICMP echo every target is probed with.
#[derive(Debug, Clone)]
pub struct UnitPlan {
    pub ports: PortStrategy,
    pub protocols: Vec<Protocol>,
    pub ping: bool,
}

impl UnitPlan {
    /// Number of units generated for each target.
    pub fn units_per_target(&self) -> usize {
        self.ports.len() * self.protocols.len() + usize::from(self.ping)
    }

    /// The (port, protocol) pairs every target is probed on.
    pub fn unit_keys(&self) -> HashSet<(u16, Protocol)> {
        let echo = self.ping.then_some((0, Protocol::Icmp));
        self.ports
            .ordered_iter()
            .cartesian_product(self.protocols.iter().copied())
            .chain(echo)
            .collect()
    }

    /// Lazily expands targets into scan units, target by target.
    pub fn units<'a>(&'a self, targets: &'a [Arc<Target>]) -> ScanUnits<'a> {
        let inner = targets.iter().flat_map(move |target| {
            let echo = self.ping.then(|| ScanUnit {
                target: Arc::clone(target),
                port: 0,
                protocol: Protocol::Icmp,
            });

            let ports = self.ports.ordered_iter().flat_map(move |port| {
                self.protocols.iter().map(move |&protocol| ScanUnit {
                    target: Arc::clone(target),
                    port,
                    protocol,
                })
            });

            echo.into_iter().chain(ports)
        });

        ScanUnits {
            inner: Box::new(inner),
            remaining: targets.len() * self.units_per_target(),
        }
    }
}

/// Lazy, consumable sequence of scan units with a known length.
///
/// Consuming it is the only way to obtain the units; restarting a scan
/// means expanding the targets again.
pub struct ScanUnits<'a> {
    inner: Box<dyn Iterator<Item = ScanUnit> + Send + 'a>,
    remaining: usize,
}

impl Iterator for ScanUnits<'_> {
    type Item = ScanUnit;

    fn next(&mut self) -> Option<ScanUnit> {
        let unit = self.inner.next()?;
        self.remaining = self.remaining.saturating_sub(1);
        Some(unit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ScanUnits<'_> {}

fn looks_like_address(spec: &str) -> bool {
    spec.contains('/')
        || spec.contains(':')
        || spec.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn is_valid_hostname(spec: &str) -> bool {
    spec.len() <= 253
        && spec
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && label.len() <= 63
                    && !label.starts_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            })
}

/// Non-empty, non-comment lines of a target file.
async fn read_lines(path: &str) -> io::Result<Vec<String>> {
    let lines = fs::read_to_string(path)
        .await?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect();

    Ok(lines)
}

/// Derive a DNS resolver.
///
/// 1. if the `resolver` parameter has been set:
///     1. assume the parameter is a path and attempt to read IPs.
///     2. parse the input as a comma-separated list of IPs.
/// 2. if `resolver` is not set:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver.
async fn get_resolver(resolver: &Option<String>) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_from_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r.trim()).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    DnsProtocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default())
        }),
    }
}

/// Parses an input file of resolver IPs.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}
