//! Client statistics
//!
//! Counters are updated lock-free by every operation of a
//! [`CachedHttpClient`](crate::CachedHttpClient) and can be read at any time
//! as a serializable [`ClientStatsSnapshot`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    revalidated: AtomicU64,
    misses: AtomicU64,
    bytes_saved: AtomicU64,
    bytes_downloaded: AtomicU64,
    writes: AtomicU64,
}

/// Shared statistics tracker
#[derive(Debug, Clone)]
pub struct ClientStats {
    counters: Arc<Counters>,
    start_time: Instant,
}

/// Statistics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientStatsSnapshot {
    /// Served from disk without contacting the origin
    pub hits: u64,
    /// Served from disk after the origin answered `304`
    pub revalidated: u64,
    /// Downloaded because nothing usable was cached
    pub misses: u64,
    /// Body bytes served from disk (hits and revalidations)
    pub bytes_saved: u64,
    /// Body bytes downloaded and written
    pub bytes_downloaded: u64,
    /// Entries written, including headers-only entries
    pub writes: u64,
    /// Hits and revalidations as a percentage of all lookups (0.0 to 100.0)
    pub hit_rate: f64,
    pub uptime_seconds: u64,
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            start_time: Instant::now(),
        }
    }

    /// Record a body served from disk without a request
    pub fn record_hit(&self, bytes: u64) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a body served from disk after a `304`
    pub fn record_revalidated(&self, bytes: u64) {
        self.counters.revalidated.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_saved.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a download that replaced (or created) an entry
    pub fn record_miss(&self, bytes: u64) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_downloaded
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.counters.hits.load(Ordering::Relaxed)
    }

    pub fn revalidated(&self) -> u64 {
        self.counters.revalidated.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.counters.misses.load(Ordering::Relaxed)
    }

    /// Calculate hit rate as a percentage (0.0 to 100.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits() + self.revalidated();
        let total = served + self.misses();

        if total == 0 {
            0.0
        } else {
            (served as f64 / total as f64) * 100.0
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Reset all counters
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.hits,
            &c.revalidated,
            &c.misses,
            &c.bytes_saved,
            &c.bytes_downloaded,
            &c.writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        let c = &self.counters;

        ClientStatsSnapshot {
            hits: self.hits(),
            revalidated: self.revalidated(),
            misses: self.misses(),
            bytes_saved: c.bytes_saved.load(Ordering::Relaxed),
            bytes_downloaded: c.bytes_downloaded.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            uptime_seconds: self.uptime().as_secs(),
        }
    }
}
