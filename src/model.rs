//! Data carried between the resolver, scheduler, aggregator and notifier.
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_derive::Serialize;

use crate::monitor::Change;

/// Transport used to probe a unit.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    /// ICMP echo, host reachability only. Units carry port 0.
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        })
    }
}

/// A resolved scan target. Immutable once resolved.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub address: IpAddr,
    pub hostname: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

impl Target {
    pub fn new(address: IpAddr, hostname: Option<String>) -> Self {
        Self {
            address,
            hostname,
            discovered_at: Utc::now(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(host) => write!(f, "{host} ({})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// One probe task: a (target, port, protocol) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanUnit {
    pub target: Arc<Target>,
    pub port: u16,
    pub protocol: Protocol,
}

impl ScanUnit {
    pub fn socket(&self) -> SocketAddr {
        SocketAddr::new(self.target.address, self.port)
    }
}

impl fmt::Display for ScanUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Icmp => write!(f, "{}/icmp", self.target.address),
            proto => write!(f, "{}/{proto}", self.socket()),
        }
    }
}

/// Classified outcome of a single probe.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Open,
    Closed,
    Filtered,
    Timeout,
    Error,
}

/// Outcome of one [`ScanUnit`]. Immutable after creation.
#[derive(Serialize, Debug, Clone)]
pub struct ProbeResult {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub status: ProbeStatus,
    pub latency: Duration,
    pub banner: Option<String>,
    /// Describes the transport failure for [`ProbeStatus::Error`].
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    pub fn new(unit: &ScanUnit, status: ProbeStatus, latency: Duration) -> Self {
        Self {
            address: unit.target.address,
            port: unit.port,
            protocol: unit.protocol,
            status,
            latency,
            banner: None,
            cause: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_banner(mut self, banner: Option<String>) -> Self {
        self.banner = banner;
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// An open port inside a [`ScanReport`].
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PortFinding {
    pub port: u16,
    pub protocol: Protocol,
    pub service: String,
    pub banner: Option<String>,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    InProgress,
    Complete,
}

/// Per status counters of a report.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub open: usize,
    pub closed: usize,
    pub filtered: usize,
    pub timeout: usize,
    pub error: usize,
}

impl Summary {
    pub fn count(&mut self, status: ProbeStatus) {
        match status {
            ProbeStatus::Open => self.open += 1,
            ProbeStatus::Closed => self.closed += 1,
            ProbeStatus::Filtered => self.filtered += 1,
            ProbeStatus::Timeout => self.timeout += 1,
            ProbeStatus::Error => self.error += 1,
        }
    }

    pub const fn total(&self) -> usize {
        self.open + self.closed + self.filtered + self.timeout + self.error
    }
}

/// Aggregated results for one [`Target`].
#[derive(Serialize, Debug, Clone)]
pub struct ScanReport {
    pub target: Target,
    pub status: ReportStatus,
    /// Open ports ordered by (port, protocol).
    pub open_ports: Vec<PortFinding>,
    /// Result of the ICMP echo, when one was requested.
    pub host_up: Option<bool>,
    pub summary: Summary,
    /// `port/proto: cause` for every probe that ended in an error.
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanReport {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            status: ReportStatus::InProgress,
            open_ports: Vec::new(),
            host_up: None,
            summary: Summary::default(),
            errors: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub const fn is_complete(&self) -> bool {
        matches!(self.status, ReportStatus::Complete)
    }

    /// Open port numbers in ascending order.
    pub fn open_port_numbers(&self) -> Vec<u16> {
        self.open_ports.iter().map(|f| f.port).collect()
    }

    pub fn finding(&self, port: u16, protocol: Protocol) -> Option<&PortFinding> {
        self.open_ports
            .iter()
            .find(|f| f.port == port && f.protocol == protocol)
    }
}

/// A message destined for the notifier.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Emitted once per completed target.
    Report(ScanReport),
    /// Differences between two consecutive monitoring rounds of a target.
    Changes { target: Target, changes: Vec<Change> },
    /// A fatal error of a scan session.
    Error { message: String },
    /// Monitoring lifecycle notice (started, stopped).
    Notice { message: String },
}
