//! One scan from target specifications to finished reports.
//!
//! Wires the resolver, scheduler, aggregator and notifier together:
//! resolved targets are expanded into scan units, the scanner's results are
//! folded into reports as they arrive and every completed report is handed
//! to the notifier without waiting for delivery.

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::address::{TargetResolver, UnitPlan, DEFAULT_MAX_HOSTS};
use crate::aggregator::Aggregator;
use crate::error::{ResolutionError, SchedulerError};
use crate::model::{NotificationEvent, ScanReport};
use crate::notify::NotifierHandle;
use crate::scanner::{ScanStats, Scanner};

/// Everything a finished (or cancelled) session produced.
#[derive(Debug)]
pub struct SessionOutcome {
    /// One report per resolved target, in resolution order. Reports of a
    /// cancelled session may still be in progress.
    pub reports: Vec<ScanReport>,
    pub resolution_errors: Vec<ResolutionError>,
    pub stats: ScanStats,
    /// Duplicate or unexpected results dropped by the aggregator.
    pub anomalies: usize,
}

impl SessionOutcome {
    pub fn complete_reports(&self) -> impl Iterator<Item = &ScanReport> {
        self.reports.iter().filter(|report| report.is_complete())
    }
}

pub struct ScanSession {
    targets: Vec<String>,
    exclude: Vec<String>,
    resolver: TargetResolver,
    plan: UnitPlan,
    scanner: Scanner,
    notifier: Option<NotifierHandle>,
    notify_empty: bool,
}

impl ScanSession {
    pub fn new(targets: Vec<String>, plan: UnitPlan, scanner: Scanner) -> Self {
        Self {
            targets,
            exclude: Vec::new(),
            resolver: TargetResolver::new(DEFAULT_MAX_HOSTS),
            plan,
            scanner,
            notifier: None,
            notify_empty: true,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: TargetResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Addresses, networks or hosts removed after expansion.
    #[must_use]
    pub fn with_exclusions(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: NotifierHandle) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Whether reports without open ports are notified too.
    #[must_use]
    pub const fn notify_empty(mut self, notify_empty: bool) -> Self {
        self.notify_empty = notify_empty;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.scanner.cancellation_token()
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Resolves, scans and aggregates once.
    ///
    /// Resolution failures are collected in the outcome. The only error is
    /// a scheduler overload, which is also sent to the notifier.
    pub async fn run(&self) -> Result<SessionOutcome, SchedulerError> {
        let resolution = self.resolver.resolve(&self.targets, &self.exclude).await;
        for error in &resolution.errors {
            warn!("{error}");
        }
        let targets = resolution.targets;
        info!(
            "Scanning {} targets with {} units each",
            targets.len(),
            self.plan.units_per_target()
        );

        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let aggregator = Aggregator::new(&targets, &self.plan, completed_tx);
        let forwarder = tokio::spawn(forward_reports(
            completed_rx,
            self.notifier.clone(),
            self.notify_empty,
        ));

        let (results_tx, mut results_rx) = mpsc::channel(1024);
        let collector = tokio::spawn(async move {
            while let Some(result) = results_rx.recv().await {
                aggregator.record(result);
            }
            aggregator
        });

        let scanned = self.scanner.run(self.plan.units(&targets), results_tx).await;

        // The collector ends once the scanner has dropped every results sender.
        let (reports, anomalies) = match collector.await {
            Ok(aggregator) => {
                let anomalies = aggregator.anomalies();
                (aggregator.into_reports(), anomalies)
            }
            Err(e) => {
                warn!("Result collector failed: {e}");
                (Vec::new(), 0)
            }
        };
        if let Err(e) = forwarder.await {
            warn!("Report forwarder failed: {e}");
        }

        let stats = match scanned {
            Ok(stats) => stats,
            Err(error) => {
                warn!("{error}");
                if let Some(notifier) = &self.notifier {
                    notifier.notify(NotificationEvent::Error {
                        message: error.to_string(),
                    });
                }
                return Err(error);
            }
        };

        if stats.cancelled {
            info!(
                "Scan cancelled, {} of {} units skipped",
                stats.skipped, stats.queued
            );
        }

        Ok(SessionOutcome {
            reports,
            resolution_errors: resolution.errors,
            stats,
            anomalies,
        })
    }
}

/// Hands each completed report to the notifier as it is finalized.
async fn forward_reports(
    mut completed: mpsc::UnboundedReceiver<ScanReport>,
    notifier: Option<NotifierHandle>,
    notify_empty: bool,
) {
    while let Some(report) = completed.recv().await {
        let Some(notifier) = &notifier else {
            continue;
        };
        if report.open_ports.is_empty() && !notify_empty {
            debug!("No open ports on {}, not notifying", report.target);
            continue;
        }
        // Delivery is tracked by the notifier itself.
        notifier.notify(NotificationEvent::Report(report));
    }
}

#[cfg(test)]
mod tests {
    use super::ScanSession;
    use crate::address::UnitPlan;
    use crate::error::{DeliveryError, SchedulerError};
    use crate::model::{NotificationEvent, ProbeResult, ProbeStatus, Protocol, ReportStatus, ScanUnit};
    use crate::notify::{Notifier, Notify, RetryPolicy};
    use crate::port_strategy::PortStrategy;
    use crate::scanner::probe::Probe;
    use crate::scanner::Scanner;
    use async_trait::async_trait;
    use std::num::NonZeroUsize;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Port 22 is open everywhere, all else closed.
    struct SshOnly {
        delay: Duration,
    }

    #[async_trait]
    impl Probe for SshOnly {
        async fn probe(&self, unit: &ScanUnit) -> ProbeResult {
            tokio::time::sleep(self.delay).await;
            let status = if unit.port == 22 {
                ProbeStatus::Open
            } else {
                ProbeStatus::Closed
            };
            ProbeResult::new(unit, status, self.delay)
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

    fn plan(ports: Vec<u16>) -> UnitPlan {
        UnitPlan {
            ports: PortStrategy::Serial(ports),
            protocols: vec![Protocol::Tcp],
            ping: false,
        }
    }

    fn scanner(delay: Duration) -> Scanner {
        Scanner::new(Arc::new(SshOnly { delay }), NonZeroUsize::new(4).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn reports_follow_target_order() {
        let session = ScanSession::new(
            vec!["192.0.2.8/31".to_owned(), "192.0.2.1".to_owned()],
            plan(vec![22, 80]),
            scanner(Duration::from_millis(10)),
        );

        let outcome = session.run().await.unwrap();

        let addresses = outcome
            .reports
            .iter()
            .map(|r| r.target.address.to_string())
            .collect::<Vec<_>>();
        assert_eq!(addresses, ["192.0.2.8", "192.0.2.9", "192.0.2.1"]);
        assert!(outcome.reports.iter().all(|r| r.open_port_numbers() == [22]));
        assert_eq!(outcome.stats.dispatched, 6);
        assert_eq!(outcome.anomalies, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_errors_do_not_stop_the_scan() {
        let session = ScanSession::new(
            vec!["10.0.0.300".to_owned(), "10.0.0.1".to_owned()],
            plan(vec![22]),
            scanner(Duration::from_millis(1)),
        );

        let outcome = session.run().await.unwrap();

        assert_eq!(outcome.resolution_errors.len(), 1);
        assert_eq!(outcome.reports.len(), 1);
        assert!(outcome.reports[0].is_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_reports_can_be_kept_quiet() {
        let inbox = Arc::new(Inbox::default());
        let notifier = Notifier::spawn(inbox.clone(), RetryPolicy::default());
        let session = ScanSession::new(
            vec!["10.0.0.1".to_owned(), "10.0.0.2".to_owned()],
            plan(vec![80, 443]),
            scanner(Duration::from_millis(1)),
        )
        .with_notifier(notifier.handle())
        .notify_empty(false);

        let outcome = session.run().await.unwrap();
        drop(session);
        let delivered = notifier.shutdown().await;

        assert_eq!(outcome.complete_reports().count(), 2);
        assert_eq!(delivered.delivered, 0);
        assert!(inbox.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overload_is_reported_to_the_notifier() {
        let inbox = Arc::new(Inbox::default());
        let notifier = Notifier::spawn(inbox.clone(), RetryPolicy::default());
        let session = ScanSession::new(
            vec!["10.0.0.0/30".to_owned()],
            plan(vec![22, 80]),
            scanner(Duration::from_millis(1)).with_max_backlog(Some(4)),
        )
        .with_notifier(notifier.handle());

        let error = session.run().await.unwrap_err();
        drop(session);
        notifier.shutdown().await;

        assert_eq!(error, SchedulerError::Overload { pending: 8, max: 4 });
        let events = inbox.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NotificationEvent::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reports_stay_in_progress_and_unnotified() {
        let inbox = Arc::new(Inbox::default());
        let notifier = Notifier::spawn(inbox.clone(), RetryPolicy::default());
        let session = ScanSession::new(
            vec!["10.0.0.1".to_owned()],
            plan((1..=100).collect()),
            scanner(Duration::from_millis(100)),
        )
        .with_notifier(notifier.handle());
        let cancel = session.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cancel.cancel();
        });

        let outcome = session.run().await.unwrap();
        drop(session);
        notifier.shutdown().await;

        assert!(outcome.stats.cancelled);
        assert_eq!(outcome.reports[0].status, ReportStatus::InProgress);
        assert_eq!(outcome.reports[0].summary.total(), outcome.stats.dispatched);
        assert!(inbox.0.lock().unwrap().is_empty());
    }
}
