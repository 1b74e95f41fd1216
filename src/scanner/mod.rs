//! Core functionality for actual scanning behaviour.
//!
//! The [`Scanner`] feeds scan units through a bounded work queue to a fixed
//! pool of workers. Each worker takes a rate limiter permit before it
//! dispatches a unit to the [`Probe`] and forwards the result on the
//! results channel.
pub mod probe;
pub mod rate_limit;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;
use crate::model::{ProbeResult, ScanUnit};
use probe::Probe;
use rate_limit::RateLimiter;

/// Counters describing one scheduler run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    /// Units taken from the input and placed on the work queue.
    pub queued: usize,
    /// Units handed to the probe. Each produced exactly one result.
    pub dispatched: usize,
    /// Queued units dropped because the scan was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicUsize,
    skipped: AtomicUsize,
}

/// Worker pool executing scan units with bounded concurrency.
///
/// At most `workers` probes are in flight; when all workers are busy the
/// feeder blocks on the work queue instead of spawning more tasks.
pub struct Scanner {
    probe: Arc<dyn Probe>,
    workers: NonZeroUsize,
    queue_depth: NonZeroUsize,
    max_backlog: Option<usize>,
    limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
}

impl Scanner {
    pub fn new(probe: Arc<dyn Probe>, workers: NonZeroUsize) -> Self {
        Self {
            probe,
            workers,
            queue_depth: workers,
            max_backlog: None,
            limiter: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Capacity of the work queue between the feeder and the workers.
    #[must_use]
    pub const fn with_queue_depth(mut self, depth: NonZeroUsize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Rejects runs submitting more than `max` units.
    #[must_use]
    pub const fn with_max_backlog(mut self, max: Option<usize>) -> Self {
        self.max_backlog = max;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consumes `units` exactly once, probing each dispatched unit and
    /// sending its result on `results`.
    ///
    /// Results arrive in completion order, not submission order. After
    /// cancellation no further unit is dispatched; probes already in flight
    /// finish or time out and still deliver their result.
    pub async fn run<I>(
        &self,
        units: I,
        results: mpsc::Sender<ProbeResult>,
    ) -> Result<ScanStats, SchedulerError>
    where
        I: IntoIterator<Item = ScanUnit>,
        I::IntoIter: ExactSizeIterator,
    {
        let units = units.into_iter();
        let pending = units.len();
        if let Some(max) = self.max_backlog {
            if pending > max {
                return Err(SchedulerError::Overload { pending, max });
            }
        }

        debug!(
            "Start scanning units.\nWorkers {}\nQueue depth {}\nUnits {pending}",
            self.workers,
            self.queue_depth
        );

        let (queue_tx, queue_rx) = mpsc::channel::<ScanUnit>(self.queue_depth.get());
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let counters = Arc::new(Counters::default());

        let mut workers = JoinSet::new();
        for _ in 0..self.workers.get() {
            workers.spawn(worker(
                Arc::clone(&queue_rx),
                Arc::clone(&self.probe),
                self.limiter.clone(),
                self.cancel.clone(),
                results.clone(),
                Arc::clone(&counters),
            ));
        }
        drop(results);

        let mut queued = 0;
        for unit in units {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                sent = queue_tx.send(unit) => {
                    if sent.is_err() {
                        warn!("All workers stopped, aborting dispatch");
                        break;
                    }
                    queued += 1;
                }
            }
        }
        drop(queue_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Scan worker failed: {e}");
            }
        }

        let stats = ScanStats {
            queued,
            dispatched: counters.dispatched.load(Ordering::Acquire),
            skipped: counters.skipped.load(Ordering::Acquire),
            cancelled: self.cancel.is_cancelled(),
        };
        debug!("Scan finished: {stats:?}");
        Ok(stats)
    }
}

async fn worker(
    queue: Arc<Mutex<mpsc::Receiver<ScanUnit>>>,
    probe: Arc<dyn Probe>,
    limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
    results: mpsc::Sender<ProbeResult>,
    counters: Arc<Counters>,
) {
    loop {
        let Some(unit) = queue.lock().await.recv().await else {
            break;
        };

        if cancel.is_cancelled() {
            counters.skipped.fetch_add(1, Ordering::AcqRel);
            continue;
        }

        if let Some(limiter) = &limiter {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    counters.skipped.fetch_add(1, Ordering::AcqRel);
                    continue;
                }
                () = limiter.acquire() => {}
            }
        }

        counters.dispatched.fetch_add(1, Ordering::AcqRel);
        let result = probe.probe(&unit).await;
        if results.send(result).await.is_err() {
            warn!("Result receiver dropped, discarding result of {unit}");
        }
    }
}
