use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reconwatch::address::UnitPlan;
use reconwatch::error::DeliveryError;
use reconwatch::model::{NotificationEvent, ProbeResult, ProbeStatus, Protocol, ScanUnit};
use reconwatch::notify::{Notifier, Notify, RetryPolicy};
use reconwatch::port_strategy::PortStrategy;
use reconwatch::scanner::probe::Probe;
use reconwatch::scanner::rate_limit::RateLimiter;
use reconwatch::scanner::Scanner;
use reconwatch::session::ScanSession;

/// Only 10.0.0.1:22 answers.
struct SingleOpenPort {
    probes: AtomicU32,
}

#[async_trait]
impl Probe for SingleOpenPort {
    async fn probe(&self, unit: &ScanUnit) -> ProbeResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(3)).await;

        let open = unit.target.address == "10.0.0.1".parse::<IpAddr>().unwrap() && unit.port == 22;
        let status = if open {
            ProbeStatus::Open
        } else {
            ProbeStatus::Closed
        };
        ProbeResult::new(unit, status, Duration::from_millis(3))
    }
}

/// Rejects the first delivery of every event, then accepts it.
#[derive(Default)]
struct UnreliableChat {
    calls: AtomicU32,
    received: Mutex<Vec<NotificationEvent>>,
}

#[async_trait]
impl Notify for UnreliableChat {
    async fn send(&self, event: &NotificationEvent) -> Result<(), DeliveryError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(DeliveryError::Rejected {
                status: 502,
                body: "Bad Gateway".to_owned(),
            });
        }
        self.received.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn scanner(probe: Arc<SingleOpenPort>) -> Scanner {
    Scanner::new(probe, NonZeroUsize::new(3).unwrap()).with_rate_limiter(Arc::new(
        RateLimiter::new(NonZeroU32::new(100).unwrap(), NonZeroU32::new(5).unwrap()),
    ))
}

fn plan() -> UnitPlan {
    UnitPlan {
        ports: PortStrategy::Serial(vec![22, 80]),
        protocols: vec![Protocol::Tcp],
        ping: false,
    }
}

#[tokio::test(start_paused = true)]
async fn slash_30_with_one_open_port() {
    let probe = Arc::new(SingleOpenPort {
        probes: AtomicU32::new(0),
    });
    let session = ScanSession::new(vec!["10.0.0.0/30".to_owned()], plan(), scanner(probe.clone()));

    let outcome = session.run().await.unwrap();

    assert_eq!(outcome.reports.len(), 4);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 8);
    assert_eq!(outcome.stats.dispatched, 8);
    assert!(outcome.resolution_errors.is_empty());

    for report in &outcome.reports {
        assert!(report.is_complete());
        assert_eq!(report.summary.total(), 2);
        if report.target.address.to_string() == "10.0.0.1" {
            assert_eq!(report.open_port_numbers(), [22]);
            assert_eq!(report.open_ports[0].service, "ssh");
        } else {
            assert!(report.open_ports.is_empty());
            assert_eq!(report.summary.closed, 2);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn completed_reports_survive_a_flaky_channel() {
    let probe = Arc::new(SingleOpenPort {
        probes: AtomicU32::new(0),
    });
    let chat = Arc::new(UnreliableChat::default());
    let notifier = Notifier::spawn(chat.clone(), RetryPolicy::default());
    let session = ScanSession::new(vec!["10.0.0.0/30".to_owned()], plan(), scanner(probe))
        .with_notifier(notifier.handle())
        .notify_empty(false);

    let outcome = session.run().await.unwrap();
    drop(session);
    let delivery = notifier.shutdown().await;

    assert_eq!(outcome.complete_reports().count(), 4);
    assert_eq!(delivery.delivered, 1);
    assert!(delivery.undelivered.is_empty());

    let received = chat.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    match &received[0] {
        NotificationEvent::Report(report) => {
            assert_eq!(report.target.address.to_string(), "10.0.0.1");
            assert_eq!(report.open_port_numbers(), [22]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn exclusions_shrink_the_target_set() {
    let probe = Arc::new(SingleOpenPort {
        probes: AtomicU32::new(0),
    });
    let session = ScanSession::new(vec!["10.0.0.0/30".to_owned()], plan(), scanner(probe.clone()))
        .with_exclusions(vec!["10.0.0.0".to_owned(), "10.0.0.3".to_owned()]);

    let outcome = session.run().await.unwrap();

    let addresses = outcome
        .reports
        .iter()
        .map(|r| r.target.address.to_string())
        .collect::<Vec<_>>();
    assert_eq!(addresses, ["10.0.0.1", "10.0.0.2"]);
    assert_eq!(probe.probes.load(Ordering::SeqCst), 4);
}
