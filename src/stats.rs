//! Query statistics and the metric ring
//!
//! Counters are monotonic atomics incremented on the query path; the
//! failed-domain set and the metric ring are lock-guarded and snapshotted
//! whole when the admin view serializes them, so readers never observe a
//! torn state.
//!
//! The metric ring is bounded: once [`METRIC_RING_CAPACITY`] events are
//! held, each push evicts the oldest.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::table::Entry;

/// Maximum number of metric events retained
pub const METRIC_RING_CAPACITY: usize = 1024;

/// Wall-clock milliseconds since the Unix epoch
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Kind of a recorded metric event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MetricKind {
    /// A query was refused by policy
    Block,
    /// An upstream lookup completed
    Fetch,
    /// A question was answered (every served question records one)
    Answer,
}

/// One observability event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    /// Event kind
    #[serde(rename = "type")]
    pub kind: MetricKind,
    /// Wall-clock time of the event, Unix milliseconds
    pub time: u64,
    /// Address involved (answer address, or the blocked sentinel)
    pub ip: String,
    /// Origin server for the event
    pub server: String,
    /// Domain the event concerns
    pub domain: String,
    /// Elapsed processing time in milliseconds
    pub time_ms: u64,
}

impl Metric {
    /// Build a metric stamped with the current wall-clock time
    #[must_use]
    pub fn new(
        kind: MetricKind,
        ip: impl Into<String>,
        server: impl Into<String>,
        domain: impl Into<String>,
        time_ms: u64,
    ) -> Self {
        Self {
            kind,
            time: unix_millis(),
            ip: ip.into(),
            server: server.into(),
            domain: domain.into(),
            time_ms,
        }
    }
}

/// Global query statistics
///
/// Shared by the query engine (writers) and the admin view (reader).
#[derive(Debug)]
pub struct Stats {
    started_at: u64,
    started: Instant,
    lookup_requests: AtomicU64,
    cached_requests: AtomicU64,
    blocked_requests: AtomicU64,
    failed_requests: AtomicU64,
    failed_domains: RwLock<BTreeSet<String>>,
    metrics: Mutex<VecDeque<Metric>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    /// Create a zeroed statistics block stamped with the current time
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: unix_millis(),
            started: Instant::now(),
            lookup_requests: AtomicU64::new(0),
            cached_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            failed_domains: RwLock::new(BTreeSet::new()),
            metrics: Mutex::new(VecDeque::with_capacity(METRIC_RING_CAPACITY)),
        }
    }

    /// Record an upstream lookup that produced an answer
    pub fn record_lookup(&self) {
        self.lookup_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a question answered from the resolution table
    pub fn record_cached(&self) {
        self.cached_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a question refused by policy
    pub fn record_blocked(&self) {
        self.blocked_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a question that could not be answered
    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Remember a domain whose upstream lookup failed
    pub fn record_failed_domain(&self, domain: &str) {
        self.failed_domains.write().insert(domain.to_string());
    }

    /// Append a metric event, evicting the oldest when the ring is full
    pub fn push_metric(&self, metric: Metric) {
        let mut ring = self.metrics.lock();
        if ring.len() >= METRIC_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(metric);
    }

    /// Lookup counter value
    #[must_use]
    pub fn lookup_requests(&self) -> u64 {
        self.lookup_requests.load(Ordering::Relaxed)
    }

    /// Cached counter value
    #[must_use]
    pub fn cached_requests(&self) -> u64 {
        self.cached_requests.load(Ordering::Relaxed)
    }

    /// Blocked counter value
    #[must_use]
    pub fn blocked_requests(&self) -> u64 {
        self.blocked_requests.load(Ordering::Relaxed)
    }

    /// Failed counter value
    #[must_use]
    pub fn failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }

    /// Snapshot everything for serialization
    ///
    /// `domains` is passed in by the caller (the admin view sorts the table
    /// snapshot first). Metrics are cloned out only when requested.
    #[must_use]
    pub fn snapshot(&self, domains: Vec<Entry>, include_metrics: bool) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started_at,
            running: format!("{}s", self.started.elapsed().as_secs()),
            lookup_requests: self.lookup_requests(),
            cached_requests: self.cached_requests(),
            blocked_requests: self.blocked_requests(),
            failed_requests: self.failed_requests(),
            domains,
            failed_domains: self.failed_domains.read().iter().cloned().collect(),
            metrics: include_metrics.then(|| self.metrics.lock().iter().cloned().collect()),
        }
    }
}

/// Serializable view of [`Stats`] for the admin endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Server start time, Unix milliseconds
    pub started: u64,
    /// Human-readable uptime
    pub running: String,
    /// Questions answered via upstream lookup
    pub lookup_requests: u64,
    /// Questions answered from the table
    pub cached_requests: u64,
    /// Questions refused by policy
    pub blocked_requests: u64,
    /// Questions that could not be answered
    pub failed_requests: u64,
    /// Table snapshot, sorted by the caller
    pub domains: Vec<Entry>,
    /// Domains whose upstream lookups have failed
    pub failed_domains: Vec<String>,
    /// Metric ring contents, present only when requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<Metric>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let stats = Stats::new();
        stats.record_lookup();
        stats.record_lookup();
        stats.record_cached();
        stats.record_blocked();
        stats.record_failed();

        assert_eq!(stats.lookup_requests(), 2);
        assert_eq!(stats.cached_requests(), 1);
        assert_eq!(stats.blocked_requests(), 1);
        assert_eq!(stats.failed_requests(), 1);
    }

    #[test]
    fn test_metric_ring_is_bounded() {
        let stats = Stats::new();
        for i in 0..METRIC_RING_CAPACITY + 10 {
            stats.push_metric(Metric::new(
                MetricKind::Answer,
                "1.2.3.4",
                "8.8.8.8:53",
                format!("d{i}.test."),
                1,
            ));
        }

        let snapshot = stats.snapshot(Vec::new(), true);
        let metrics = snapshot.metrics.unwrap();
        assert_eq!(metrics.len(), METRIC_RING_CAPACITY);
        // Oldest events were evicted.
        assert_eq!(metrics[0].domain, "d10.test.");
    }

    #[test]
    fn test_snapshot_omits_metrics_by_default() {
        let stats = Stats::new();
        stats.push_metric(Metric::new(MetricKind::Block, "Blocked!", "127.0.0.1", "x.test.", 0));

        let snapshot = stats.snapshot(Vec::new(), false);
        assert!(snapshot.metrics.is_none());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("metrics").is_none());
        assert!(json.get("lookupRequests").is_some());
    }

    #[test]
    fn test_failed_domains_deduplicate() {
        let stats = Stats::new();
        stats.record_failed_domain("x.test.");
        stats.record_failed_domain("x.test.");
        stats.record_failed_domain("a.test.");

        let snapshot = stats.snapshot(Vec::new(), false);
        assert_eq!(snapshot.failed_domains, vec!["a.test.", "x.test."]);
    }

    #[test]
    fn test_metric_serialization_shape() {
        let metric = Metric::new(MetricKind::Fetch, "1.2.3.4", "8.8.8.8:53", "x.test.", 12);
        let json = serde_json::to_value(&metric).unwrap();
        assert_eq!(json["type"], "Fetch");
        assert_eq!(json["timeMs"], 12);
        assert!(json["time"].is_u64());
    }
}
