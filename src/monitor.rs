//! Continuous monitoring: periodic rescans diffed against the last round.
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::{EitherOrBoth, Itertools};
use log::{error, info};
use serde_derive::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::model::{NotificationEvent, PortFinding, Protocol, ScanReport, Target};
use crate::notify::NotifierHandle;
use crate::session::ScanSession;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);
/// Number of changes kept in the monitor history.
pub const HISTORY_LIMIT: usize = 1000;

/// Difference in one open port between two scans of a target.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    PortOpened {
        port: u16,
        protocol: Protocol,
        service: String,
    },
    PortClosed {
        port: u16,
        protocol: Protocol,
        service: String,
    },
    ServiceChanged {
        port: u16,
        protocol: Protocol,
        old: String,
        new: String,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortOpened {
                port,
                protocol,
                service,
            } => write!(f, "NEW PORT OPENED {port}/{protocol} ({service})"),
            Self::PortClosed {
                port,
                protocol,
                service,
            } => write!(f, "PORT CLOSED {port}/{protocol} ({service})"),
            Self::ServiceChanged {
                port,
                protocol,
                old,
                new,
            } => write!(f, "SERVICE CHANGE {port}/{protocol} ({old} -> {new})"),
        }
    }
}

/// Compares the open ports of two reports of the same target.
///
/// Changes come out ordered by port, then protocol.
pub fn detect_changes(previous: &ScanReport, current: &ScanReport) -> Vec<Change> {
    let key = |finding: &PortFinding| (finding.port, finding.protocol);

    previous
        .open_ports
        .iter()
        .sorted_by_key(|&f| key(f))
        .merge_join_by(
            current.open_ports.iter().sorted_by_key(|&f| key(f)),
            |&old, &new| key(old).cmp(&key(new)),
        )
        .filter_map(|pair| match pair {
            EitherOrBoth::Left(old) => Some(Change::PortClosed {
                port: old.port,
                protocol: old.protocol,
                service: old.service.clone(),
            }),
            EitherOrBoth::Right(new) => Some(Change::PortOpened {
                port: new.port,
                protocol: new.protocol,
                service: new.service.clone(),
            }),
            EitherOrBoth::Both(old, new) if old.service != new.service => {
                Some(Change::ServiceChanged {
                    port: new.port,
                    protocol: new.protocol,
                    old: old.service.clone(),
                    new: new.service.clone(),
                })
            }
            EitherOrBoth::Both(..) => None,
        })
        .collect()
}

/// A change observed during monitoring.
#[derive(Serialize, Debug, Clone)]
pub struct HistoryEntry {
    pub round: u64,
    pub observed_at: DateTime<Utc>,
    pub target: Target,
    pub change: Change,
}

/// Reruns a [`ScanSession`] on an interval and reports what changed.
///
/// The first complete report of a target becomes its baseline; each later
/// complete report is compared against the one before it. Incomplete
/// reports, from a cancelled round, are never compared.
pub struct Monitor {
    session: ScanSession,
    interval: Duration,
    notifier: Option<NotifierHandle>,
    cancel: CancellationToken,
    baseline: HashMap<IpAddr, ScanReport>,
    history: VecDeque<HistoryEntry>,
    rounds: u64,
}

impl Monitor {
    /// Cancelling the session's token also stops the monitor.
    pub fn new(session: ScanSession, interval: Duration) -> Self {
        let cancel = session.cancellation_token();
        Self {
            session,
            interval,
            notifier: None,
            cancel,
            baseline: HashMap::new(),
            history: VecDeque::new(),
            rounds: 0,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: NotifierHandle) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Observed changes, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub const fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Latest complete report per target.
    pub fn latest(&self, address: &IpAddr) -> Option<&ScanReport> {
        self.baseline.get(address)
    }

    /// Scans once and notifies the changes of every target.
    pub async fn round(&mut self) -> Result<Vec<(Target, Vec<Change>)>, SchedulerError> {
        let outcome = self.session.run().await?;
        self.rounds += 1;

        let mut changed = Vec::new();
        for report in outcome.reports {
            if !report.is_complete() {
                continue;
            }

            let address = report.target.address;
            let Some(previous) = self.baseline.get(&address) else {
                info!(
                    "Baseline for {}: {} open ports",
                    report.target,
                    report.open_ports.len()
                );
                self.baseline.insert(address, report);
                continue;
            };

            let changes = detect_changes(previous, &report);
            if changes.is_empty() {
                info!("No changes detected for {}", report.target);
            } else {
                self.record(&report.target, &changes);
                if let Some(notifier) = &self.notifier {
                    notifier.notify(NotificationEvent::Changes {
                        target: report.target.clone(),
                        changes: changes.clone(),
                    });
                }
                changed.push((report.target.clone(), changes));
            }
            self.baseline.insert(address, report);
        }

        Ok(changed)
    }

    /// Runs rounds until cancelled. Returns the number of rounds completed.
    ///
    /// A round rejected by the scheduler is logged and retried on the next
    /// tick.
    pub async fn run(&mut self) -> u64 {
        self.notice(format!(
            "Started monitoring {}, rescanning every {}s",
            self.session.targets().join(", "),
            self.interval.as_secs()
        ));

        loop {
            if let Err(e) = self.round().await {
                error!("Monitoring round failed: {e}");
            }
            if self.cancel.is_cancelled() {
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        self.notice(format!(
            "Stopped monitoring {} after {} rounds",
            self.session.targets().join(", "),
            self.rounds
        ));
        self.rounds
    }

    fn record(&mut self, target: &Target, changes: &[Change]) {
        for change in changes {
            info!("{target}: {change}");
            if self.history.len() == HISTORY_LIMIT {
                self.history.pop_front();
            }
            self.history.push_back(HistoryEntry {
                round: self.rounds,
                observed_at: Utc::now(),
                target: target.clone(),
                change: change.clone(),
            });
        }
    }

    fn notice(&self, message: String) {
        info!("{message}");
        if let Some(notifier) = &self.notifier {
            notifier.notify(NotificationEvent::Notice { message });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{detect_changes, Change, Monitor, HISTORY_LIMIT};
    use crate::address::UnitPlan;
    use crate::error::DeliveryError;
    use crate::model::{
        NotificationEvent, PortFinding, ProbeResult, ProbeStatus, Protocol, ScanReport, ScanUnit,
        Target,
    };
    use crate::notify::{Notifier, Notify, RetryPolicy};
    use crate::port_strategy::PortStrategy;
    use crate::scanner::probe::Probe;
    use crate::scanner::Scanner;
    use crate::services::service_name;
    use crate::session::ScanSession;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::num::NonZeroUsize;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn report(ports: &[(u16, &str)]) -> ScanReport {
        let mut report = ScanReport::new(Target::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None));
        report.open_ports = ports
            .iter()
            .map(|&(port, service)| PortFinding {
                port,
                protocol: Protocol::Tcp,
                service: service.to_owned(),
                banner: None,
            })
            .collect();
        report
    }

    #[test]
    fn opened_closed_and_changed_ports() {
        let previous = report(&[(22, "ssh"), (80, "http"), (8080, "http-proxy")]);
        let current = report(&[(22, "ssh"), (443, "https"), (8080, "ssh")]);

        let changes = detect_changes(&previous, &current);

        assert_eq!(
            changes,
            [
                Change::PortClosed {
                    port: 80,
                    protocol: Protocol::Tcp,
                    service: "http".to_owned()
                },
                Change::PortOpened {
                    port: 443,
                    protocol: Protocol::Tcp,
                    service: "https".to_owned()
                },
                Change::ServiceChanged {
                    port: 8080,
                    protocol: Protocol::Tcp,
                    old: "http-proxy".to_owned(),
                    new: "ssh".to_owned()
                },
            ]
        );
    }

    #[test]
    fn same_port_on_another_protocol_is_a_different_finding() {
        let previous = report(&[(53, "dns")]);
        let mut current = report(&[]);
        current.open_ports.push(PortFinding {
            port: 53,
            protocol: Protocol::Udp,
            service: "dns".to_owned(),
            banner: None,
        });

        let changes = detect_changes(&previous, &current);

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].to_string(), "PORT CLOSED 53/tcp (dns)");
        assert_eq!(changes[1].to_string(), "NEW PORT OPENED 53/udp (dns)");
    }

    #[test]
    fn identical_reports_have_no_changes() {
        let ports = [(22, "ssh"), (443, "https")];
        assert!(detect_changes(&report(&ports), &report(&ports)).is_empty());
    }

    /// Open ports (with banners) are set from the test between rounds.
    #[derive(Default)]
    struct Switchboard(Mutex<HashMap<u16, Option<String>>>);

    impl Switchboard {
        fn set(&self, ports: &[(u16, Option<&str>)]) {
            *self.0.lock().unwrap() = ports
                .iter()
                .map(|&(port, banner)| (port, banner.map(str::to_owned)))
                .collect();
        }
    }

    #[async_trait]
    impl Probe for Switchboard {
        async fn probe(&self, unit: &ScanUnit) -> ProbeResult {
            let open = self.0.lock().unwrap().get(&unit.port).cloned();
            match open {
                Some(banner) => ProbeResult::new(unit, ProbeStatus::Open, Duration::ZERO).with_banner(banner),
                None => ProbeResult::new(unit, ProbeStatus::Closed, Duration::ZERO),
            }
        }
    }

    #[derive(Default)]
    struct Inbox(Mutex<Vec<NotificationEvent>>);

    #[async_trait]
    impl Notify for Inbox {
        async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn monitor(probe: Arc<Switchboard>, interval: Duration) -> Monitor {
        let plan = UnitPlan {
            ports: PortStrategy::Serial(vec![22, 80, 8080]),
            protocols: vec![Protocol::Tcp],
            ping: false,
        };
        let scanner = Scanner::new(probe, NonZeroUsize::new(2).unwrap());
        Monitor::new(ScanSession::new(vec!["10.1.1.1".to_owned()], plan, scanner), interval)
    }

    #[tokio::test]
    async fn rounds_are_compared_with_the_previous_one() {
        let probe = Arc::new(Switchboard::default());
        let mut monitor = monitor(probe.clone(), Duration::from_secs(300));

        probe.set(&[(22, None), (8080, None)]);
        assert!(monitor.round().await.unwrap().is_empty());

        probe.set(&[(80, None), (8080, Some("SSH-2.0-OpenSSH_9.6"))]);
        let changed = monitor.round().await.unwrap();

        assert_eq!(changed.len(), 1);
        let (target, changes) = &changed[0];
        assert_eq!(target.address.to_string(), "10.1.1.1");
        assert_eq!(
            changes.iter().map(ToString::to_string).collect::<Vec<_>>(),
            [
                "PORT CLOSED 22/tcp (ssh)".to_owned(),
                "NEW PORT OPENED 80/tcp (http)".to_owned(),
                format!("SERVICE CHANGE 8080/tcp ({} -> ssh)", service_name(8080, None)),
            ]
        );
        assert_eq!(monitor.history().count(), 3);
        assert!(monitor.history().all(|entry| entry.round == 2));
        assert_eq!(monitor.rounds(), 2);

        probe.set(&[(80, None), (8080, Some("SSH-2.0-OpenSSH_9.6"))]);
        assert!(monitor.round().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_rescans_on_interval_until_cancelled() {
        let probe = Arc::new(Switchboard::default());
        probe.set(&[(22, None)]);
        let inbox = Arc::new(Inbox::default());
        let notifier = Notifier::spawn(inbox.clone(), RetryPolicy::default());
        let mut monitor =
            monitor(probe.clone(), Duration::from_secs(300)).with_notifier(notifier.handle());

        let cancel = monitor.cancellation_token();
        let switch = probe.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(450)).await;
            switch.set(&[(22, None), (80, None)]);
            tokio::time::sleep(Duration::from_secs(200)).await;
            cancel.cancel();
        });

        let rounds = monitor.run().await;
        drop(monitor);
        notifier.shutdown().await;

        // Rounds at 0s, 300s and 600s.
        assert_eq!(rounds, 3);
        let events = inbox.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], NotificationEvent::Notice { message } if message.starts_with("Started")));
        match &events[1] {
            NotificationEvent::Changes { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].to_string(), "NEW PORT OPENED 80/tcp (http)");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(&events[2], NotificationEvent::Notice { message } if message.starts_with("Stopped")));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let probe = Arc::new(Switchboard::default());
        let mut monitor = monitor(probe, Duration::from_secs(1));
        let target = Target::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None);
        let change = Change::PortOpened {
            port: 22,
            protocol: Protocol::Tcp,
            service: "ssh".to_owned(),
        };

        for _ in 0..HISTORY_LIMIT + 5 {
            monitor.record(&target, std::slice::from_ref(&change));
        }

        assert_eq!(monitor.history().count(), HISTORY_LIMIT);
    }
}
