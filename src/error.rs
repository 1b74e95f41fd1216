//! Error taxonomy shared by the resolver, scheduler and notifier.
//!
//! Per-unit failures never cross a component boundary as errors: probe
//! failures become [`ProbeStatus::Error`](crate::model::ProbeStatus) results
//! and delivery failures become [`DeliveryOutcome`](crate::notify::DeliveryOutcome)s.
//! Only configuration problems are fatal.
use thiserror::Error;

/// A target specification that could not be turned into addresses.
///
/// Reported to the caller; resolution of the remaining targets continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("invalid address syntax {spec:?}: {reason}")]
    InvalidAddress { spec: String, reason: String },

    #[error("could not resolve host {host:?}")]
    Dns { host: String },

    #[error("{spec:?} expands to {hosts} hosts, exceeding the limit of {max}")]
    FanOutExceeded { spec: String, hosts: u128, max: usize },
}

/// Transport failure observed while probing a single unit.
///
/// Never returned from the probe engine; it is folded into the
/// [`ProbeResult`](crate::model::ProbeResult) cause string.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("too many open files, reduce the worker count")]
    TooManyOpenFiles,

    #[error("icmp echo failed: {0}")]
    Icmp(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Scheduler level failures surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler overloaded: {pending} units queued, maximum is {max}")]
    Overload { pending: usize, max: usize },
}

/// A notification that could not be delivered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rejected by channel (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("notifier is not running")]
    Closed,
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Fatal startup errors: invalid pool size, rate or malformed settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("worker pool size must be at least 1")]
    InvalidPoolSize,

    #[error("probe rate must be at least 1 probe per second")]
    InvalidRate,

    #[error("no ports selected for scanning")]
    NoPorts,

    #[error("invalid telegram token: {0}")]
    InvalidTelegramToken(String),

    #[error("invalid telegram chat id {0:?}")]
    InvalidChatId(String),

    #[error("telegram needs both a bot token and a chat id")]
    IncompleteTelegram,

    #[error("monitoring interval must be at least one second")]
    InvalidInterval,

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
