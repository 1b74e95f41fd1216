//! This crate exposes the internal functionality of the reconwatch network
//! reconnaissance scanner.
//!
//! reconwatch expands targets (IPs, CIDR ranges, hostnames or files of them)
//! into scan units, probes them with a bounded worker pool under a rate
//! limit, folds the results into one report per host and pushes finished
//! reports, or the changes between monitoring rounds, to Telegram.
//!
//! ## Architecture Overview
//!
//! 1. **Target resolution**: [`TargetResolver`](crate::address::TargetResolver)
//!    turns addresses, networks and hostnames into deduplicated targets,
//!    bounded by a maximum host count.
//! 2. **Scheduling**: [`Scanner`](crate::scanner::Scanner) feeds the units
//!    through a bounded queue to a fixed pool of workers, each taking a
//!    token from the shared [`RateLimiter`](crate::scanner::rate_limit::RateLimiter).
//! 3. **Probing**: a [`Probe`](crate::scanner::probe::Probe) classifies each
//!    unit as open, closed, filtered, timed out or failed.
//! 4. **Aggregation**: the [`Aggregator`](crate::aggregator::Aggregator)
//!    completes each host's report exactly once.
//! 5. **Notification**: the [`Notifier`](crate::notify::Notifier) delivers
//!    events in the background with bounded exponential backoff.
//!
//! [`ScanSession`](crate::session::ScanSession) wires these together and
//! [`Monitor`](crate::monitor::Monitor) reruns a session on an interval.
//!
//! ## Basic Usage Example
//!
//! Any [`Probe`](crate::scanner::probe::Probe) can drive a session. This one
//! pretends every SSH port is open:
//!
//! ```rust
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use reconwatch::address::UnitPlan;
//! use reconwatch::model::{ProbeResult, ProbeStatus, Protocol, ScanUnit};
//! use reconwatch::port_strategy::PortStrategy;
//! use reconwatch::scanner::probe::Probe;
//! use reconwatch::scanner::Scanner;
//! use reconwatch::session::ScanSession;
//!
//! struct SshEverywhere;
//!
//! #[async_trait]
//! impl Probe for SshEverywhere {
//!     async fn probe(&self, unit: &ScanUnit) -> ProbeResult {
//!         let status = if unit.port == 22 { ProbeStatus::Open } else { ProbeStatus::Closed };
//!         ProbeResult::new(unit, status, Duration::ZERO)
//!     }
//! }
//!
//! let plan = UnitPlan {
//!     ports: PortStrategy::Serial(vec![22, 80]),
//!     protocols: vec![Protocol::Tcp],
//!     ping: false,
//! };
//! let scanner = Scanner::new(Arc::new(SshEverywhere), NonZeroUsize::new(8).unwrap());
//! let session = ScanSession::new(vec!["192.168.0.0/30".to_owned()], plan, scanner);
//!
//! let outcome = tokio::runtime::Runtime::new()
//!     .unwrap()
//!     .block_on(session.run())
//!     .unwrap();
//!
//! assert_eq!(outcome.reports.len(), 4);
//! for report in &outcome.reports {
//!     assert_eq!(report.open_port_numbers(), [22]);
//! }
//! ```
#![allow(clippy::needless_doctest_main)]

pub mod tui;

pub mod input;

pub mod error;

pub mod model;

pub mod services;

pub mod address;

pub mod port_strategy;

pub mod scanner;

pub mod aggregator;

pub mod notify;

pub mod session;

pub mod monitor;
