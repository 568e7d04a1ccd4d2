use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{unix_now_millis, LedgerHealth};

/// Pipeline counters. Mutated only by the orchestrator, read by anyone.
#[derive(Debug)]
pub struct RelayerMetrics {
    processed: AtomicU64,
    errored: AtomicU64,
    rejected: AtomicU64,
    deduplicated: AtomicU64,
    dropped: AtomicU64,
    start_time: u64,
    last_activity: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Processed,
    Errored,
    Rejected,
    Deduplicated,
    Dropped,
}

impl RelayerMetrics {
    pub fn new(start_time: u64) -> Self {
        Self {
            processed: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            start_time,
            last_activity: AtomicU64::new(start_time),
        }
    }

    pub(crate) fn incr(&self, counter: Counter) {
        let cell = match counter {
            Counter::Processed => &self.processed,
            Counter::Errored => &self.errored,
            Counter::Rejected => &self.rejected,
            Counter::Deduplicated => &self.deduplicated,
            Counter::Dropped => &self.dropped,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn touch(&self, now: u64) {
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn snapshot(
        &self,
        name: &str,
        running: bool,
        retry_queue_size: usize,
        processed_count: usize,
        now: u64,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            name: name.to_string(),
            running,
            uptime: now.saturating_sub(self.start_time),
            messages_processed: self.processed.load(Ordering::Relaxed),
            messages_errored: self.errored.load(Ordering::Relaxed),
            messages_rejected: self.rejected.load(Ordering::Relaxed),
            messages_deduplicated: self.deduplicated.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            retry_queue_size,
            processed_count,
            start_time: self.start_time,
            last_activity: self.last_activity.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayerMetrics {
    fn default() -> Self {
        Self::new(unix_now_millis())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub name: String,
    pub running: bool,
    /// Milliseconds since the orchestrator was built.
    pub uptime: u64,
    pub messages_processed: u64,
    pub messages_errored: u64,
    pub messages_rejected: u64,
    pub messages_deduplicated: u64,
    pub messages_dropped: u64,
    pub retry_queue_size: usize,
    pub processed_count: usize,
    pub start_time: u64,
    pub last_activity: u64,
}

/// Body of `/health` and `/metrics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: &'static str,
    pub timestamp: String,
    pub relayer: MetricsSnapshot,
    pub source: LedgerHealth,
    pub destination: LedgerHealth,
}

impl StatusSnapshot {
    pub fn new(relayer: MetricsSnapshot, source: LedgerHealth, destination: LedgerHealth) -> Self {
        let healthy = source.connected && destination.connected;
        Self {
            status: if healthy { "healthy" } else { "unhealthy" },
            timestamp: chrono::Utc::now().to_rfc3339(),
            relayer,
            source,
            destination,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.source.connected && self.destination.connected
    }
}
