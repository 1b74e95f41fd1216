//! Collects probe results into one report per target.
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::address::UnitPlan;
use crate::model::{
    PortFinding, ProbeResult, ProbeStatus, Protocol, ReportStatus, ScanReport, Target,
};
use crate::services::service_name;

/// What happened to a result handed to [`Aggregator::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Pending { received: usize, expected: usize },
    /// This result completed the report; it has been emitted.
    Completed,
    /// Already applied, or the report was already complete. Not re-applied.
    Duplicate,
    UnknownTarget,
    /// A (port, protocol) the plan never scheduled. Not applied.
    Unplanned,
}

struct Entry {
    report: ScanReport,
    seen: HashSet<(u16, Protocol)>,
}

/// Per-target report table.
///
/// The table itself is fixed once built, so results for different
/// targets only ever lock their own entry. A report is emitted on the
/// `completed` channel exactly once, when its last expected result lands.
pub struct Aggregator {
    entries: HashMap<IpAddr, Mutex<Entry>>,
    /// (port, protocol) pairs expected for every target.
    planned: HashSet<(u16, Protocol)>,
    order: Vec<IpAddr>,
    completed: mpsc::UnboundedSender<ScanReport>,
    anomalies: AtomicUsize,
}

impl Aggregator {
    pub fn new(
        targets: &[Arc<Target>],
        plan: &UnitPlan,
        completed: mpsc::UnboundedSender<ScanReport>,
    ) -> Self {
        let planned = plan.unit_keys();
        let mut entries = HashMap::with_capacity(targets.len());
        let mut order = Vec::with_capacity(targets.len());

        for target in targets {
            let mut entry = Entry {
                report: ScanReport::new(Target::clone(target)),
                seen: HashSet::with_capacity(planned.len()),
            };
            if planned.is_empty() {
                finalize(&mut entry.report, &completed);
            }
            order.push(target.address);
            entries.insert(target.address, Mutex::new(entry));
        }

        Self {
            entries,
            planned,
            order,
            completed,
            anomalies: AtomicUsize::new(0),
        }
    }

    pub fn record(&self, result: ProbeResult) -> Recorded {
        let Some(entry) = self.entries.get(&result.address) else {
            warn!("Result for unknown target {}", result.address);
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            return Recorded::UnknownTarget;
        };
        if !self.planned.contains(&(result.port, result.protocol)) {
            warn!(
                "Unplanned result for {}:{}/{} ignored",
                result.address, result.port, result.protocol
            );
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            return Recorded::Unplanned;
        }
        let mut entry = entry.lock().unwrap_or_else(PoisonError::into_inner);

        if entry.report.is_complete() || !entry.seen.insert((result.port, result.protocol)) {
            warn!(
                "Duplicate result for {}:{}/{} ignored",
                result.address, result.port, result.protocol
            );
            self.anomalies.fetch_add(1, Ordering::Relaxed);
            return Recorded::Duplicate;
        }

        apply(&mut entry.report, result);

        let received = entry.seen.len();
        if received == self.planned.len() {
            finalize(&mut entry.report, &self.completed);
            Recorded::Completed
        } else {
            Recorded::Pending {
                received,
                expected: self.planned.len(),
            }
        }
    }

    /// Number of duplicate, unplanned or unknown results seen so far.
    pub fn anomalies(&self) -> usize {
        self.anomalies.load(Ordering::Relaxed)
    }

    /// All reports in target order, complete or not.
    pub fn into_reports(mut self) -> Vec<ScanReport> {
        self.order
            .iter()
            .filter_map(|address| self.entries.remove(address))
            .map(|entry| {
                entry
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .report
            })
            .collect()
    }
}

fn apply(report: &mut ScanReport, result: ProbeResult) {
    report.summary.count(result.status);

    match (result.protocol, result.status) {
        (Protocol::Icmp, status) => report.host_up = Some(status == ProbeStatus::Open),
        (protocol, ProbeStatus::Open) => {
            let service = service_name(result.port, result.banner.as_deref());
            report.open_ports.push(PortFinding {
                port: result.port,
                protocol,
                service,
                banner: result.banner,
            });
        }
        (protocol, ProbeStatus::Error) => report.errors.push(format!(
            "{}/{protocol}: {}",
            result.port,
            result.cause.as_deref().unwrap_or("unknown error")
        )),
        _ => {}
    }
}

fn finalize(report: &mut ScanReport, completed: &mpsc::UnboundedSender<ScanReport>) {
    report
        .open_ports
        .sort_unstable_by_key(|finding| (finding.port, finding.protocol));
    report.status = ReportStatus::Complete;
    report.completed_at = Some(Utc::now());
    debug!(
        "Report for {} complete, {} open ports",
        report.target,
        report.open_ports.len()
    );

    if completed.send(report.clone()).is_err() {
        debug!("Nobody listens for completed reports");
    }
}
