//! In-process metrics for the consent ledger
//!
//! Counters, gauges and latency histograms keyed by name. Snapshots are
//! exported as JSON.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::domain::DecisionOutcome;

/// Global metrics registry
pub struct MetricsRegistry {
    /// Counter metrics
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,

    /// Gauge metrics (current values)
    gauges: RwLock<HashMap<String, Arc<AtomicU64>>>,

    /// Histogram metrics (bucketed)
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,

    /// Service start time
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter
    pub async fn inc_counter(&self, name: &str) {
        let counters = self.counters.read().await;
        if let Some(counter) = counters.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        drop(counters);

        // Create new counter
        let mut counters = self.counters.write().await;
        let counter = counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)));
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Set a gauge value
    pub async fn set_gauge(&self, name: &str, value: u64) {
        let gauges = self.gauges.read().await;
        if let Some(gauge) = gauges.get(name) {
            gauge.store(value, Ordering::Relaxed);
            return;
        }
        drop(gauges);

        // Create new gauge
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), Arc::new(AtomicU64::new(value)));
    }

    /// Record a histogram observation
    async fn observe_histogram(&self, name: &str, value: f64) {
        let histograms = self.histograms.read().await;
        if let Some(histogram) = histograms.get(name) {
            histogram.observe(value).await;
            return;
        }
        drop(histograms);

        // Create new histogram with default buckets
        let mut histograms = self.histograms.write().await;
        let histogram = histograms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Histogram::default()));
        histogram.observe(value).await;
    }

    /// Count a validator decision by outcome
    pub async fn record_decision(&self, outcome: DecisionOutcome) {
        let name = match outcome {
            DecisionOutcome::Allow => metric_names::DECISIONS_ALLOWED,
            DecisionOutcome::Restrict => metric_names::DECISIONS_RESTRICTED,
            DecisionOutcome::Deny => metric_names::DECISIONS_DENIED,
        };
        self.inc_counter(name).await;
    }

    /// Get all metrics as JSON
    pub async fn to_json(&self) -> serde_json::Value {
        let counters = self.counters.read().await;
        let gauges = self.gauges.read().await;
        let histograms = self.histograms.read().await;

        let counter_values: HashMap<String, u64> = counters
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let gauge_values: HashMap<String, u64> = gauges
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        let mut histogram_values: HashMap<String, serde_json::Value> = HashMap::new();
        for (name, histogram) in histograms.iter() {
            histogram_values.insert(name.clone(), histogram.to_json().await);
        }

        serde_json::json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "counters": counter_values,
            "gauges": gauge_values,
            "histograms": histogram_values,
        })
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Simple histogram implementation
struct Histogram {
    /// Bucket boundaries
    buckets: Vec<f64>,

    /// Count per bucket
    counts: RwLock<Vec<AtomicU64>>,

    /// Sum of all observations
    sum: AtomicU64,

    /// Total count of observations
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts: RwLock::new(counts),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record an observation
    async fn observe(&self, value: f64) {
        // Add to sum (store as bits)
        let bits = (value * 1000.0) as u64; // Store with millisecond precision
        self.sum.fetch_add(bits, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        // Increment appropriate bucket
        let counts = self.counts.read().await;
        for (i, bucket) in self.buckets.iter().enumerate() {
            if value <= *bucket {
                counts[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Get histogram as JSON
    async fn to_json(&self) -> serde_json::Value {
        let counts = self.counts.read().await;
        let bucket_counts: Vec<u64> = counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": bucket_counts,
            "sum": self.sum.load(Ordering::Relaxed) as f64 / 1000.0,
            "count": self.count.load(Ordering::Relaxed),
        })
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Default buckets for latency in seconds
        Self::new(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    // Decisions
    pub const DECISIONS_ALLOWED: &str = "consent.decisions.allowed";
    pub const DECISIONS_RESTRICTED: &str = "consent.decisions.restricted";
    pub const DECISIONS_DENIED: &str = "consent.decisions.denied";
    pub const DECISION_LATENCY: &str = "consent.decisions.latency_seconds";

    // Ledger mutations
    pub const GRANTS_RECORDED: &str = "consent.grants.recorded";
    pub const GRANTS_REVOKED: &str = "consent.grants.revoked";

    // Packaging
    pub const PACKAGES_ISSUED: &str = "consent.packages.issued";
    pub const PACKAGES_FAILED: &str = "consent.packages.failed";
    pub const PACKAGE_LATENCY: &str = "consent.packages.latency_seconds";
    pub const TOKENS_REDEEMED: &str = "consent.tokens.redeemed";
    pub const TOKENS_REJECTED: &str = "consent.tokens.rejected";

    // Audit chain
    pub const AUDIT_ENTRIES_APPENDED: &str = "consent.audit.appended";
    pub const AUDIT_HEAD_SEQUENCE: &str = "consent.audit.head_sequence";
    pub const CHAIN_VERIFICATIONS: &str = "consent.audit.verifications";
    pub const CHAIN_FAILURES: &str = "consent.audit.integrity_failures";

    // Trust scoring
    pub const TRUST_RECOMPUTES: &str = "consent.trust.recomputes";
    pub const TRUST_BUYERS: &str = "consent.trust.buyers";
}

/// Helper function to time an async operation
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    let duration = start.elapsed().as_secs_f64();
    metrics.observe_histogram(metric_name, duration).await;
    result
}
