//! Scan configuration
//!
//! All knobs the pipeline consumes, with serde defaults matching the
//! documented defaults. The CLI populates this explicitly; `load()` allows
//! env-var overrides with a `KRS_` prefix for in-cluster use.

use crate::error::Result;
use chrono::Duration;
use serde::Deserialize;

/// Dialect selection override. When absent the dialect is auto-detected
/// from the Prometheus URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectOverride {
    Standard,
    Gcp,
    Anthos,
}

/// Configuration consumed by the scan pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    /// Lookback window for all queries, in hours.
    #[serde(default = "default_history_duration_hours")]
    pub history_duration_hours: f64,

    /// Range query resampling step, in minutes.
    #[serde(default = "default_timeframe_duration_minutes")]
    pub timeframe_duration_minutes: f64,

    /// Samples required before a recommendation is made for a resource.
    #[serde(default = "default_points_required")]
    pub points_required: u64,

    /// Concurrent container slots in flight.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_cpu_min_millicores")]
    pub cpu_min_millicores: u64,

    #[serde(default = "default_memory_min_mib")]
    pub memory_min_mib: u64,

    /// Whether HPA-managed workloads still receive recommendations.
    #[serde(default)]
    pub allow_hpa: bool,

    #[serde(default = "default_true")]
    pub use_oomkill_data: bool,

    /// Label pair isolating one cluster when a Prometheus serves several.
    #[serde(default)]
    pub cluster_label_key: Option<String>,
    #[serde(default)]
    pub cluster_label_value: Option<String>,

    #[serde(default)]
    pub prometheus_url: Option<String>,

    #[serde(default)]
    pub prometheus_dialect_override: Option<DialectOverride>,

    /// Namespace patterns; empty means all namespaces except kube-system.
    /// `*` is a wildcard within a pattern.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Workload kinds to scan; empty means all supported kinds.
    #[serde(default)]
    pub kinds: Vec<String>,

    /// Kubernetes label selector applied when listing workloads.
    #[serde(default)]
    pub selector: Option<String>,

    /// Label keys that fold Jobs into synthetic GroupedJob workloads.
    /// Empty disables grouping.
    #[serde(default)]
    pub job_grouping_labels: Vec<String>,

    /// Member cap per job group.
    #[serde(default = "default_job_grouping_limit")]
    pub job_grouping_limit: usize,

    /// Owner names per Prometheus lookup query.
    #[serde(default = "default_owner_batch_size")]
    pub owner_batch_size: usize,

    /// `limit` used for paged Kubernetes list calls.
    #[serde(default = "default_list_page_size")]
    pub list_page_size: u32,

    /// Circuit breaker against endless continue tokens.
    #[serde(default = "default_max_list_pages")]
    pub max_list_pages: u32,

    /// Concurrent in-flight requests per Prometheus backend.
    #[serde(default = "default_prom_max_concurrent")]
    pub prom_max_concurrent: usize,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_backoff_ms")]
    pub retry_base_backoff_ms: u64,

    /// Per-call timeout against the metrics backend, in seconds.
    #[serde(default = "default_prom_timeout_secs")]
    pub prom_timeout_secs: u64,

    /// Endpoint for the AI-assisted strategy.
    #[serde(default)]
    pub llm_url: Option<String>,

    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
}

fn default_history_duration_hours() -> f64 {
    24.0 * 14.0
}

fn default_timeframe_duration_minutes() -> f64 {
    1.25
}

fn default_points_required() -> u64 {
    100
}

fn default_max_workers() -> usize {
    10
}

fn default_cpu_min_millicores() -> u64 {
    10
}

fn default_memory_min_mib() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_job_grouping_limit() -> usize {
    100
}

fn default_owner_batch_size() -> usize {
    200
}

fn default_list_page_size() -> u32 {
    500
}

fn default_max_list_pages() -> u32 {
    50
}

fn default_prom_max_concurrent() -> usize {
    8
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_backoff_ms() -> u64 {
    500
}

fn default_prom_timeout_secs() -> u64 {
    60
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            history_duration_hours: default_history_duration_hours(),
            timeframe_duration_minutes: default_timeframe_duration_minutes(),
            points_required: default_points_required(),
            max_workers: default_max_workers(),
            cpu_min_millicores: default_cpu_min_millicores(),
            memory_min_mib: default_memory_min_mib(),
            allow_hpa: false,
            use_oomkill_data: true,
            cluster_label_key: None,
            cluster_label_value: None,
            prometheus_url: None,
            prometheus_dialect_override: None,
            namespaces: Vec::new(),
            kinds: Vec::new(),
            selector: None,
            job_grouping_labels: Vec::new(),
            job_grouping_limit: default_job_grouping_limit(),
            owner_batch_size: default_owner_batch_size(),
            list_page_size: default_list_page_size(),
            max_list_pages: default_max_list_pages(),
            prom_max_concurrent: default_prom_max_concurrent(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_backoff_ms: default_retry_base_backoff_ms(),
            prom_timeout_secs: default_prom_timeout_secs(),
            llm_url: None,
            llm_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl ScanConfig {
    /// Load from environment variables prefixed with `KRS_`.
    pub fn load() -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(config::Environment::with_prefix("KRS"))
            .build()
            .and_then(|c| c.try_deserialize());

        Ok(loaded.unwrap_or_default())
    }

    pub fn history(&self) -> Duration {
        Duration::seconds((self.history_duration_hours * 3600.0) as i64)
    }

    pub fn step(&self) -> Duration {
        Duration::seconds((self.timeframe_duration_minutes * 60.0) as i64)
    }

    pub fn cluster_label(&self) -> Option<(String, String)> {
        match (&self.cluster_label_key, &self.cluster_label_value) {
            (Some(key), Some(value)) => Some((key.clone(), value.clone())),
            _ => None,
        }
    }

    pub fn cpu_min_cores(&self) -> f64 {
        self.cpu_min_millicores as f64 / 1000.0
    }

    pub fn memory_min_bytes(&self) -> f64 {
        self.memory_min_mib as f64 * 1024.0 * 1024.0
    }
}

/// Parameters of the Simple strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleSettings {
    #[serde(default = "default_cpu_percentile")]
    pub cpu_percentile: f64,
    #[serde(default = "default_memory_buffer_percentage")]
    pub memory_buffer_percentage: f64,
    #[serde(default = "default_oom_memory_buffer_percentage")]
    pub oom_memory_buffer_percentage: f64,
}

fn default_cpu_percentile() -> f64 {
    95.0
}

fn default_memory_buffer_percentage() -> f64 {
    15.0
}

fn default_oom_memory_buffer_percentage() -> f64 {
    25.0
}

impl Default for SimpleSettings {
    fn default() -> Self {
        Self {
            cpu_percentile: default_cpu_percentile(),
            memory_buffer_percentage: default_memory_buffer_percentage(),
            oom_memory_buffer_percentage: default_oom_memory_buffer_percentage(),
        }
    }
}

/// Parameters of the Simple-Limit strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct SimpleLimitSettings {
    #[serde(default = "default_cpu_request_percentile")]
    pub cpu_request_percentile: f64,
    #[serde(default = "default_cpu_limit_percentile")]
    pub cpu_limit_percentile: f64,
    #[serde(default = "default_memory_buffer_percentage")]
    pub memory_buffer_percentage: f64,
    #[serde(default = "default_oom_memory_buffer_percentage")]
    pub oom_memory_buffer_percentage: f64,
}

fn default_cpu_request_percentile() -> f64 {
    66.0
}

fn default_cpu_limit_percentile() -> f64 {
    96.0
}

impl Default for SimpleLimitSettings {
    fn default() -> Self {
        Self {
            cpu_request_percentile: default_cpu_request_percentile(),
            cpu_limit_percentile: default_cpu_limit_percentile(),
            memory_buffer_percentage: default_memory_buffer_percentage(),
            oom_memory_buffer_percentage: default_oom_memory_buffer_percentage(),
        }
    }
}

/// Shared gates every strategy honors, copied from `ScanConfig`.
#[derive(Debug, Clone, Copy)]
pub struct StrategyCommon {
    pub points_required: u64,
    pub allow_hpa: bool,
    pub use_oomkill_data: bool,
}

impl StrategyCommon {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            points_required: config.points_required,
            allow_hpa: config.allow_hpa,
            use_oomkill_data: config.use_oomkill_data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documentation() {
        let config = ScanConfig::default();
        assert_eq!(config.history_duration_hours, 336.0);
        assert_eq!(config.timeframe_duration_minutes, 1.25);
        assert_eq!(config.points_required, 100);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.cpu_min_millicores, 10);
        assert_eq!(config.memory_min_mib, 100);
        assert!(!config.allow_hpa);
        assert!(config.use_oomkill_data);
        assert_eq!(config.owner_batch_size, 200);
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn test_window_arithmetic() {
        let config = ScanConfig::default();
        assert_eq!(config.history().num_days(), 14);
        assert_eq!(config.step().num_seconds(), 75);
    }

    #[test]
    fn test_cluster_label_requires_both_parts() {
        let mut config = ScanConfig::default();
        config.cluster_label_key = Some("cluster_name".into());
        assert_eq!(config.cluster_label(), None);

        config.cluster_label_value = Some("prod-1".into());
        assert_eq!(
            config.cluster_label(),
            Some(("cluster_name".into(), "prod-1".into()))
        );
    }

    #[test]
    fn test_minima_conversion() {
        let config = ScanConfig::default();
        assert_eq!(config.cpu_min_cores(), 0.01);
        assert_eq!(config.memory_min_bytes(), 100.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn test_strategy_defaults() {
        let simple = SimpleSettings::default();
        assert_eq!(simple.cpu_percentile, 95.0);
        assert_eq!(simple.memory_buffer_percentage, 15.0);
        assert_eq!(simple.oom_memory_buffer_percentage, 25.0);

        let limit = SimpleLimitSettings::default();
        assert_eq!(limit.cpu_request_percentile, 66.0);
        assert_eq!(limit.cpu_limit_percentile, 96.0);
    }
}
