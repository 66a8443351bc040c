//! GC timing statistics.

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use lazy_static::lazy_static;

/// Duration statistics collector
pub struct TimeStats {
    count: AtomicU64,
    total_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl TimeStats {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record one completed run
    pub fn update(&self, elapsed: Duration) {
        let ns = elapsed.as_nanos() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }

    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns.load(Ordering::Relaxed))
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.max_ns.store(0, Ordering::Relaxed);
    }
}

// Global timing stats for full GC runs
lazy_static! {
    pub static ref GC_TIMES: TimeStats = TimeStats::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_runs() {
        let stats = TimeStats::new();
        stats.update(Duration::from_millis(2));
        stats.update(Duration::from_millis(5));
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.max(), Duration::from_millis(5));
        assert_eq!(stats.total(), Duration::from_millis(7));
    }
}
