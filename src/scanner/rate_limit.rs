//! Lock-free token bucket shared by all workers of a scan.
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{self, Instant};

/// Token bucket releasing `rate` permits per second with room for `burst`
/// permits at once.
///
/// The bucket is kept as a single atomic "theoretical arrival time"
/// (nanoseconds since creation of the limiter). Acquiring a permit reserves
/// the next slot with a compare-and-swap and then sleeps until that slot,
/// so concurrent callers never receive the same slot.
#[derive(Debug)]
pub struct RateLimiter {
    origin: Instant,
    interval: u64,
    tolerance: u64,
    tat: AtomicU64,
}

impl RateLimiter {
    pub fn new(rate: NonZeroU32, burst: NonZeroU32) -> Self {
        let interval = 1_000_000_000 / u64::from(rate.get());
        Self {
            origin: Instant::now(),
            interval: interval.max(1),
            tolerance: interval * u64::from(burst.get() - 1),
            tat: AtomicU64::new(0),
        }
    }

    /// Spacing between permits in steady state.
    pub const fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval)
    }

    /// Waits for the next permit.
    pub async fn acquire(&self) {
        let now = self.now();
        let grant = self.reserve(now);
        if grant > now {
            time::sleep_until(self.origin + Duration::from_nanos(grant)).await;
        }
    }

    /// Takes a permit only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let now = self.now();
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let grant = tat.max(now).saturating_sub(self.tolerance);
            if grant > now {
                return false;
            }
            let next = tat.max(now) + self.interval;
            match self
                .tat
                .compare_exchange_weak(tat, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(current) => tat = current,
            }
        }
    }

    /// Reserves a slot and returns the time (since origin) it becomes usable.
    fn reserve(&self, now: u64) -> u64 {
        let mut tat = self.tat.load(Ordering::Acquire);
        loop {
            let base = tat.max(now);
            let next = base + self.interval;
            match self
                .tat
                .compare_exchange_weak(tat, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return base.saturating_sub(self.tolerance).max(now),
                Err(current) => tat = current,
            }
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}
