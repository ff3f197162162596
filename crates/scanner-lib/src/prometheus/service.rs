//! Metric acquisition on top of a Prometheus querier
//!
//! Adds what the raw client does not have: a per-backend concurrency cap,
//! retries with exponential backoff and jitter, transparent splitting of
//! range queries the backend rejects by size, and normalization of results
//! into per-pod series keyed by the standard label names.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{PromQuerier, RawSeries};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::models::{MetricKind, PodSeries, ScanWarning};
use crate::query::{duration_literal, PromDialect, QueryBuilder, SlotSelector};

/// Splitting more than this many times means the window is hopeless.
const MAX_SPLIT_DEPTH: u32 = 4;

/// Bounded-attempt retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: StdDuration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: StdDuration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> StdDuration {
        let exp = self.base_backoff.saturating_mul(1 << attempt.min(8));
        exp + StdDuration::from_millis(jitter_ms(self.base_backoff.as_millis() as u64 / 2))
    }
}

/// Time-based jitter; good enough to spread retries without a RNG.
fn jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    now % max_ms
}

/// Result of fetching one metric kind for one slot.
#[derive(Debug, Clone, Default)]
pub struct MetricFetch {
    pub series: PodSeries,
    pub warning: Option<ScanWarning>,
}

/// Executes metric queries for one backend.
pub struct MetricService {
    querier: Arc<dyn PromQuerier>,
    builder: QueryBuilder,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    history: Duration,
    step: Duration,
}

impl MetricService {
    pub fn new(querier: Arc<dyn PromQuerier>, builder: QueryBuilder, config: &ScanConfig) -> Self {
        Self {
            querier,
            builder,
            semaphore: Arc::new(Semaphore::new(config.prom_max_concurrent.max(1))),
            retry: RetryPolicy {
                max_attempts: config.retry_max_attempts.max(1),
                base_backoff: StdDuration::from_millis(config.retry_base_backoff_ms),
            },
            history: config.history(),
            step: config.step(),
        }
    }

    pub fn dialect(&self) -> PromDialect {
        self.builder.dialect()
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.builder
    }

    pub fn history(&self) -> Duration {
        self.history
    }

    /// One-shot query with the retry and concurrency policy applied.
    pub async fn instant_query(&self, query: &str) -> Result<Vec<RawSeries>> {
        self.with_retry(|| async {
            let _permit = self
                .semaphore
                .acquire()
                .await
                .map_err(|_| ScanError::Cancelled)?;
            self.querier.query(query).await
        })
        .await
    }

    /// Range query that transparently splits the window when the backend
    /// rejects it by size, merging halves by `(pod, container)`.
    pub async fn range_query(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawSeries>> {
        self.range_query_at_depth(query, start, end, 0).await
    }

    fn range_query_at_depth<'a>(
        &'a self,
        query: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        depth: u32,
    ) -> BoxFuture<'a, Result<Vec<RawSeries>>> {
        async move {
            let step = duration_literal(self.step);
            let attempt = self
                .with_retry(|| async {
                    let _permit = self
                        .semaphore
                        .acquire()
                        .await
                        .map_err(|_| ScanError::Cancelled)?;
                    self.querier.query_range(query, start, end, &step).await
                })
                .await;

            match attempt {
                Ok(series) => Ok(series),
                Err(err)
                    if is_range_overflow(&err)
                        && depth < MAX_SPLIT_DEPTH
                        && end - start > self.step * 2 =>
                {
                    let mid = start + (end - start) / 2;
                    debug!(depth, %mid, "range rejected by size, splitting window");
                    // a non-retryable failure of either half fails the whole
                    let left = self.range_query_at_depth(query, start, mid, depth + 1).await?;
                    let right = self.range_query_at_depth(query, mid, end, depth + 1).await?;
                    Ok(merge_series(left, right))
                }
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    /// Fetch one metric kind for a container slot. Backend failures after
    /// retries become an empty series plus a warning; only authorization
    /// failures and cancellation propagate.
    pub async fn gather(
        &self,
        kind: MetricKind,
        slot: &SlotSelector<'_>,
        percentile: Option<f64>,
    ) -> Result<MetricFetch> {
        let history = duration_literal(self.history);
        let step = duration_literal(self.step);
        let query = self
            .builder
            .metric_query(kind, slot, &history, &step, percentile)?;

        let end = Utc::now()
            .duration_trunc(Duration::minutes(1))
            .unwrap_or_else(|_| Utc::now());
        let start = end - self.history;

        let uses_range = matches!(kind, MetricKind::CpuUsage | MetricKind::Memory);
        let result = if uses_range {
            self.range_query(&query, start, end).await
        } else {
            self.instant_query(&query).await
        };

        let mut fetch = match result {
            Ok(series) => MetricFetch {
                series: normalize_series(series),
                warning: None,
            },
            Err(err @ (ScanError::Auth(_) | ScanError::Cancelled)) => return Err(err),
            Err(ScanError::UnsupportedMetric(kind)) => {
                debug!(metric = %kind, "metric kind not supported by this backend");
                MetricFetch {
                    series: PodSeries::new(),
                    warning: Some(ScanWarning::MetricUnavailable),
                }
            }
            Err(err) => {
                warn!(metric = %kind, error = %err, "metric fetch failed, treating as empty");
                MetricFetch {
                    series: PodSeries::new(),
                    warning: Some(ScanWarning::MetricUnavailable),
                }
            }
        };

        if kind == MetricKind::OomKilledMemory && self.dialect().infers_oom_signal() {
            fetch.warning = Some(fetch.warning.unwrap_or(ScanWarning::OomSignalInferred));
        }

        Ok(fetch)
    }

    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient backend error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ScanError::Transient(msg)) => return Err(ScanError::Backend(msg)),
                Err(err) => return Err(err),
            }
        }
    }
}

/// Whether an error indicates the backend rejected the range by size.
fn is_range_overflow(err: &ScanError) -> bool {
    let message = match err {
        ScanError::Backend(msg) => msg,
        _ => return false,
    };
    let message = message.to_ascii_lowercase();
    message.contains("exceeded maximum resolution")
        || message.contains("too many samples")
        || message.contains("413")
}

/// Merge two half-window result sets by series identity, keeping samples
/// in time order.
fn merge_series(left: Vec<RawSeries>, right: Vec<RawSeries>) -> Vec<RawSeries> {
    let mut merged: BTreeMap<(String, String), RawSeries> = BTreeMap::new();
    for series in left.into_iter().chain(right) {
        let key = (
            series.label("pod").unwrap_or_default().to_string(),
            series.label("container").unwrap_or_default().to_string(),
        );
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.values.extend(series.values);
                if existing.value.is_none() {
                    existing.value = series.value;
                }
            }
            None => {
                merged.insert(key, series);
            }
        }
    }
    merged
        .into_values()
        .map(|mut series| {
            series
                .values
                .sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            series
        })
        .collect()
}

/// Turn raw series into per-pod sample lists. When several scrape jobs
/// report the same pod, the kubelet job wins, then the alphabetically
/// first one.
fn normalize_series(series: Vec<RawSeries>) -> PodSeries {
    let mut by_pod: BTreeMap<String, Vec<RawSeries>> = BTreeMap::new();
    for s in series {
        let Some(pod) = s.label("pod").map(str::to_string) else {
            continue;
        };
        by_pod.entry(pod).or_default().push(s);
    }

    let mut result = PodSeries::new();
    for (pod, mut candidates) in by_pod {
        candidates.sort_by(|a, b| {
            let a_job = a.label("job").unwrap_or("");
            let b_job = b.label("job").unwrap_or("");
            let a_kubelet = a_job == "kubelet";
            let b_kubelet = b_job == "kubelet";
            b_kubelet.cmp(&a_kubelet).then_with(|| a_job.cmp(b_job))
        });
        if let Some(best) = candidates.first() {
            let samples = best.samples();
            if !samples.is_empty() {
                result.insert(pod, samples);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn vector_series(pod: &str, value: f64) -> RawSeries {
        serde_json::from_value(serde_json::json!({
            "metric": {"pod": pod, "container": "main"},
            "value": [100.0, value.to_string()]
        }))
        .unwrap()
    }

    fn matrix_series(pod: &str, values: &[(f64, f64)]) -> RawSeries {
        serde_json::from_value(serde_json::json!({
            "metric": {"pod": pod, "container": "main"},
            "values": values
                .iter()
                .map(|(ts, v)| serde_json::json!([ts, v.to_string()]))
                .collect::<Vec<_>>()
        }))
        .unwrap()
    }

    /// Replays a scripted sequence of responses, one per call.
    struct ScriptedQuerier {
        script: Mutex<VecDeque<Result<Vec<RawSeries>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedQuerier {
        fn new(script: Vec<Result<Vec<RawSeries>>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn next(&self) -> Result<Vec<RawSeries>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(vec![]))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PromQuerier for ScriptedQuerier {
        async fn query_range(
            &self,
            _query: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _step: &str,
        ) -> Result<Vec<RawSeries>> {
            self.next()
        }

        async fn query(&self, _query: &str) -> Result<Vec<RawSeries>> {
            self.next()
        }

        async fn label_values(&self, _label: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn fast_config() -> ScanConfig {
        let mut config = ScanConfig::default();
        config.retry_base_backoff_ms = 1;
        config
    }

    fn service(querier: Arc<ScriptedQuerier>) -> MetricService {
        MetricService::new(
            querier,
            QueryBuilder::new(PromDialect::Standard, None),
            &fast_config(),
        )
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_succeed() {
        let querier = Arc::new(ScriptedQuerier::new(vec![
            Err(ScanError::Transient("429: slow down".into())),
            Err(ScanError::Transient("429: slow down".into())),
            Ok(vec![vector_series("web-1", 0.5)]),
        ]));
        let service = service(querier.clone());

        let result = service.instant_query("up").await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(querier.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let querier = Arc::new(ScriptedQuerier::new(vec![
            Err(ScanError::Transient("503".into())),
            Err(ScanError::Transient("503".into())),
            Err(ScanError::Transient("503".into())),
            Err(ScanError::Transient("503".into())),
        ]));
        let service = service(querier.clone());

        let result = service.instant_query("up").await;
        // exhausted retries surface as a backend error
        assert!(matches!(result, Err(ScanError::Backend(_))));
        assert_eq!(querier.calls(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_fail_fast() {
        let querier = Arc::new(ScriptedQuerier::new(vec![Err(ScanError::Backend(
            "422: parse error".into(),
        ))]));
        let service = service(querier.clone());

        let result = service.instant_query("up").await;
        assert!(matches!(result, Err(ScanError::Backend(_))));
        assert_eq!(querier.calls(), 1);
    }

    #[tokio::test]
    async fn test_range_overflow_splits_and_merges() {
        let querier = Arc::new(ScriptedQuerier::new(vec![
            Err(ScanError::Backend(
                "query processing would load too many samples".into(),
            )),
            Ok(vec![matrix_series("web-1", &[(100.0, 1.0), (175.0, 2.0)])]),
            Ok(vec![
                matrix_series("web-1", &[(250.0, 3.0)]),
                matrix_series("web-2", &[(250.0, 9.0)]),
            ]),
        ]));
        let service = service(querier.clone());

        let end = Utc::now();
        let start = end - Duration::hours(4);
        let merged = service.range_query("q", start, end).await.unwrap();

        assert_eq!(querier.calls(), 3);
        assert_eq!(merged.len(), 2);
        let web1 = merged.iter().find(|s| s.label("pod") == Some("web-1")).unwrap();
        assert_eq!(web1.values.len(), 3);
        assert!(web1.values.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[tokio::test]
    async fn test_split_fails_fast_on_non_retryable_half() {
        let querier = Arc::new(ScriptedQuerier::new(vec![
            Err(ScanError::Backend("exceeded maximum resolution".into())),
            Err(ScanError::Auth("403".into())),
        ]));
        let service = service(querier.clone());

        let end = Utc::now();
        let start = end - Duration::hours(4);
        let result = service.range_query("q", start, end).await;
        assert!(matches!(result, Err(ScanError::Auth(_))));
        // the second half was never attempted
        assert_eq!(querier.calls(), 2);
    }

    #[tokio::test]
    async fn test_gather_turns_backend_failure_into_empty_series() {
        let querier = Arc::new(ScriptedQuerier::new(vec![Err(ScanError::Backend(
            "boom".into(),
        ))]));
        let service = service(querier);

        let pods = vec!["web-1".to_string()];
        let slot = SlotSelector {
            namespace: "default",
            pods: &pods,
            container: "main",
        };
        let fetch = service
            .gather(MetricKind::MaxMemory, &slot, None)
            .await
            .unwrap();
        assert!(fetch.series.is_empty());
        assert_eq!(fetch.warning, Some(ScanWarning::MetricUnavailable));
    }

    #[tokio::test]
    async fn test_gather_propagates_auth_errors() {
        let querier = Arc::new(ScriptedQuerier::new(vec![Err(ScanError::Auth(
            "401".into(),
        ))]));
        let service = service(querier);

        let pods = vec!["web-1".to_string()];
        let slot = SlotSelector {
            namespace: "default",
            pods: &pods,
            container: "main",
        };
        let result = service.gather(MetricKind::MaxMemory, &slot, None).await;
        assert!(matches!(result, Err(ScanError::Auth(_))));
    }

    #[tokio::test]
    async fn test_gather_marks_inferred_oom_signal() {
        let querier = Arc::new(ScriptedQuerier::new(vec![Ok(vec![vector_series(
            "db-0",
            1073741824.0,
        )])]));
        let service = MetricService::new(
            querier,
            QueryBuilder::new(PromDialect::GcpManaged, None),
            &fast_config(),
        );

        let pods = vec!["db-0".to_string()];
        let slot = SlotSelector {
            namespace: "default",
            pods: &pods,
            container: "main",
        };
        let fetch = service
            .gather(MetricKind::OomKilledMemory, &slot, None)
            .await
            .unwrap();
        assert_eq!(fetch.warning, Some(ScanWarning::OomSignalInferred));
        assert_eq!(fetch.series.len(), 1);
    }

    #[test]
    fn test_normalize_prefers_kubelet_job() {
        let mut kubelet = vector_series("web-1", 2.0);
        kubelet.metric.insert("job".into(), "kubelet".into());
        let mut cadvisor = vector_series("web-1", 1.0);
        cadvisor.metric.insert("job".into(), "cadvisor".into());

        let normalized = normalize_series(vec![cadvisor, kubelet]);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized["web-1"][0].value, 2.0);
    }

    #[test]
    fn test_normalize_falls_back_to_first_job_alphabetically() {
        let mut a = vector_series("web-1", 1.0);
        a.metric.insert("job".into(), "aaa".into());
        let mut b = vector_series("web-1", 2.0);
        b.metric.insert("job".into(), "bbb".into());

        let normalized = normalize_series(vec![b, a]);
        assert_eq!(normalized["web-1"][0].value, 1.0);
    }

    #[test]
    fn test_normalize_skips_series_without_pod_label() {
        let orphan: RawSeries = serde_json::from_value(serde_json::json!({
            "metric": {"container": "main"},
            "value": [1.0, "5"]
        }))
        .unwrap();
        assert!(normalize_series(vec![orphan]).is_empty());
    }
}
