//! Observability for the scan pipeline
//!
//! Prometheus metrics for the scan itself (latency, retries, error and
//! row counters) plus structured event logging. Metrics register once in
//! a global registry; handles are cheap to clone.

use prometheus::{register_histogram, register_int_gauge, Histogram, IntGauge};
use std::sync::OnceLock;
use tracing::{info, warn};

const LATENCY_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

static GLOBAL_METRICS: OnceLock<ScanMetricsInner> = OnceLock::new();

struct ScanMetricsInner {
    query_latency_seconds: Histogram,
    queries_total: IntGauge,
    query_retries_total: IntGauge,
    slots_scanned_total: IntGauge,
    slot_errors_total: IntGauge,
    workloads_discovered_total: IntGauge,
    clusters_failed_total: IntGauge,
}

impl ScanMetricsInner {
    fn new() -> Self {
        Self {
            query_latency_seconds: register_histogram!(
                "krs_query_latency_seconds",
                "Latency of metric backend queries",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register query_latency_seconds"),

            queries_total: register_int_gauge!(
                "krs_queries_total",
                "Total queries issued to metric backends"
            )
            .expect("Failed to register queries_total"),

            query_retries_total: register_int_gauge!(
                "krs_query_retries_total",
                "Total query retries after transient failures"
            )
            .expect("Failed to register query_retries_total"),

            slots_scanned_total: register_int_gauge!(
                "krs_slots_scanned_total",
                "Container slots that produced a scan result"
            )
            .expect("Failed to register slots_scanned_total"),

            slot_errors_total: register_int_gauge!(
                "krs_slot_errors_total",
                "Container slots that failed and produced an undefined row"
            )
            .expect("Failed to register slot_errors_total"),

            workloads_discovered_total: register_int_gauge!(
                "krs_workloads_discovered_total",
                "Workloads emitted by discovery"
            )
            .expect("Failed to register workloads_discovered_total"),

            clusters_failed_total: register_int_gauge!(
                "krs_clusters_failed_total",
                "Clusters that could not be scanned"
            )
            .expect("Failed to register clusters_failed_total"),
        }
    }
}

/// Handle to the global scan metrics.
#[derive(Clone)]
pub struct ScanMetrics {
    _private: (),
}

impl Default for ScanMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ScanMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ScanMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_query_latency(&self, duration_secs: f64) {
        self.inner().query_latency_seconds.observe(duration_secs);
    }

    pub fn inc_queries(&self) {
        self.inner().queries_total.inc();
    }

    pub fn inc_query_retries(&self) {
        self.inner().query_retries_total.inc();
    }

    pub fn inc_slots_scanned(&self) {
        self.inner().slots_scanned_total.inc();
    }

    pub fn inc_slot_errors(&self) {
        self.inner().slot_errors_total.inc();
    }

    pub fn add_workloads_discovered(&self, count: i64) {
        self.inner().workloads_discovered_total.add(count);
    }

    pub fn inc_clusters_failed(&self) {
        self.inner().clusters_failed_total.inc();
    }
}

/// Structured event logging for scan lifecycle milestones.
#[derive(Clone)]
pub struct ScanLogger {
    strategy: String,
}

impl ScanLogger {
    pub fn new(strategy: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
        }
    }

    pub fn log_scan_started(&self, clusters: usize) {
        info!(
            event = "scan_started",
            strategy = %self.strategy,
            clusters = clusters,
            "Starting resource scan"
        );
    }

    pub fn log_recommendation(
        &self,
        cluster: &str,
        namespace: &str,
        kind: &str,
        name: &str,
        container: &str,
        state: &str,
    ) {
        info!(
            event = "recommendation",
            strategy = %self.strategy,
            cluster = %cluster,
            namespace = %namespace,
            kind = %kind,
            name = %name,
            container = %container,
            state = %state,
            "Computed recommendation"
        );
    }

    pub fn log_cluster_failed(&self, cluster: &str, error: &str) {
        warn!(
            event = "cluster_failed",
            cluster = %cluster,
            error = %error,
            "Cluster could not be scanned"
        );
    }

    pub fn log_scan_finished(&self, rows: usize, failed_clusters: usize) {
        info!(
            event = "scan_finished",
            strategy = %self.strategy,
            rows = rows,
            failed_clusters = failed_clusters,
            "Scan finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle() {
        let metrics = ScanMetrics::new();
        metrics.observe_query_latency(0.05);
        metrics.inc_queries();
        metrics.inc_query_retries();
        metrics.inc_slots_scanned();
        metrics.inc_slot_errors();
        metrics.add_workloads_discovered(3);
        metrics.inc_clusters_failed();

        // a second handle shares the global registry
        let _again = ScanMetrics::new();
    }

    #[test]
    fn test_logger_construction() {
        let logger = ScanLogger::new("simple");
        logger.log_scan_started(1);
        logger.log_scan_finished(0, 0);
    }
}
