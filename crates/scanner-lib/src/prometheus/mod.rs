//! Prometheus-compatible backend access
//!
//! [`PromQuerier`] is the thin HTTP seam (one implementation per process,
//! fakes in tests); [`MetricService`] layers the scan-specific behavior on
//! top: concurrency capping, retries, range splitting and label
//! normalization.

mod client;
mod service;

pub use client::PrometheusClient;
pub use service::{MetricFetch, MetricService, RetryPolicy};

use std::collections::BTreeMap;

use crate::error::Result;
use crate::models::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One series as returned by the query API. Range queries fill `values`,
/// instant queries fill `value`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSeries {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<(f64, String)>,
    #[serde(default)]
    pub value: Option<(f64, String)>,
}

impl RawSeries {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.metric.get(name).map(String::as_str)
    }

    /// All samples of the series, instant results included, with
    /// non-finite values dropped.
    pub fn samples(&self) -> Vec<Sample> {
        let pairs = self
            .values
            .iter()
            .chain(self.value.as_ref().into_iter())
            .filter_map(|(ts, raw)| {
                let value: f64 = raw.parse().ok()?;
                value.is_finite().then(|| Sample::new(*ts, value))
            });
        pairs.collect()
    }
}

/// Minimal query surface of a Prometheus-compatible backend.
#[async_trait]
pub trait PromQuerier: Send + Sync {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: &str,
    ) -> Result<Vec<RawSeries>>;

    async fn query(&self, query: &str) -> Result<Vec<RawSeries>>;

    async fn label_values(&self, label: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_series_samples_merges_value_forms() {
        let series: RawSeries = serde_json::from_value(serde_json::json!({
            "metric": {"pod": "web-1", "container": "main"},
            "values": [[100.0, "0.5"], [175.0, "0.75"], [250.0, "NaN"]]
        }))
        .unwrap();
        let samples = series.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].value, 0.5);
        assert_eq!(samples[1].timestamp, 175.0);

        let instant: RawSeries = serde_json::from_value(serde_json::json!({
            "metric": {"pod": "web-1"},
            "value": [300.0, "42"]
        }))
        .unwrap();
        assert_eq!(instant.samples(), vec![Sample::new(300.0, 42.0)]);
    }
}
