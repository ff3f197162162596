//! The AI-assisted strategy
//!
//! Summarizes the bundle into descriptive statistics, sends them to an
//! external LLM endpoint as one JSON prompt, and validates the returned
//! numbers: values are clamped to sane bounds and compared against the
//! Simple baseline. Implausible answers are flagged but still returned;
//! accepting or rejecting them is the operator's call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{
    percentile, MetricQuery, Proposal, ResourceProposal, RunResult, Strategy, StrategyContext,
};
use crate::config::StrategyCommon;
use crate::error::{Result, ScanError};
use crate::models::{MetricBundle, MetricKind, ResourceType};

const CPU_MIN_CORES: f64 = 0.01;
const CPU_MAX_CORES: f64 = 16.0;
const MEMORY_MIN_BYTES: f64 = 100.0 * 1024.0 * 1024.0;
const MEMORY_MAX_BYTES: f64 = 64.0 * 1024.0 * 1024.0 * 1024.0;

/// How far from the Simple baseline an answer may sit before it is
/// flagged, as a fraction of the baseline.
const DEVIATION_THRESHOLD: f64 = 0.5;

/// The JSON object the endpoint must return.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LlmAnswer {
    pub cpu_request: Option<f64>,
    pub cpu_limit: Option<f64>,
    pub memory_request: Option<f64>,
    pub memory_limit: Option<f64>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

/// Seam to the LLM endpoint, injected so tests can stub it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn recommend(&self, prompt: &str) -> Result<LlmAnswer>;
}

/// Single-POST JSON client. Vendor-specific request shapes stay outside
/// the core; this speaks one JSON object in, one out.
pub struct HttpLlmClient {
    http: reqwest::Client,
    url: Url,
}

impl HttpLlmClient {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Backend(format!("failed to build LLM client: {e}")))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn recommend(&self, prompt: &str) -> Result<LlmAnswer> {
        let response = self
            .http
            .post(self.url.clone())
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::from_status(status, body));
        }
        Ok(response.json().await?)
    }
}

/// Descriptive statistics handed to the model.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageSummary {
    pub cpu_p50: f64,
    pub cpu_p75: f64,
    pub cpu_p90: f64,
    pub cpu_p95: f64,
    pub cpu_p99: f64,
    pub cpu_max: f64,
    pub cpu_mean: f64,
    pub cpu_stddev: f64,
    pub cpu_trend_per_hour: f64,
    pub cpu_spikes: usize,
    pub memory_max_bytes: f64,
    pub memory_mean_bytes: f64,
    pub memory_stddev_bytes: f64,
    pub oom_killed_bytes: f64,
    pub pods: usize,
}

impl UsageSummary {
    pub fn from_bundle(bundle: &MetricBundle) -> Self {
        let cpu = bundle.pooled_values(MetricKind::CpuUsage);
        let memory = bundle.pooled_values(MetricKind::MaxMemory);

        let cpu_mean = mean(&cpu);
        let cpu_stddev = stddev(&cpu, cpu_mean);
        let memory_mean = mean(&memory);

        Self {
            cpu_p50: percentile(&cpu, 50.0),
            cpu_p75: percentile(&cpu, 75.0),
            cpu_p90: percentile(&cpu, 90.0),
            cpu_p95: percentile(&cpu, 95.0),
            cpu_p99: percentile(&cpu, 99.0),
            cpu_max: cpu.iter().copied().fold(f64::NAN, f64::max),
            cpu_mean,
            cpu_stddev,
            cpu_trend_per_hour: cpu_trend_per_hour(bundle),
            cpu_spikes: spike_count(&cpu, cpu_mean, cpu_stddev),
            memory_max_bytes: memory.iter().copied().fold(f64::NAN, f64::max),
            memory_mean_bytes: memory_mean,
            memory_stddev_bytes: stddev(&memory, memory_mean),
            oom_killed_bytes: bundle
                .max_over_pods(MetricKind::OomKilledMemory)
                .unwrap_or(0.0),
            pods: bundle
                .get(MetricKind::CpuUsage)
                .map(|pods| pods.len())
                .unwrap_or(0),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 || !mean.is_finite() {
        return 0.0;
    }
    let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Samples more than three standard deviations above the mean.
fn spike_count(values: &[f64], mean: f64, stddev: f64) -> usize {
    if !mean.is_finite() || stddev <= 0.0 {
        return 0;
    }
    values.iter().filter(|v| (*v - mean) / stddev > 3.0).count()
}

/// Slope of the least-squares line over the pooled CPU series, scaled to
/// cores per hour.
fn cpu_trend_per_hour(bundle: &MetricBundle) -> f64 {
    let Some(pods) = bundle.get(MetricKind::CpuUsage) else {
        return 0.0;
    };
    let mut points: Vec<(f64, f64)> = pods
        .values()
        .flat_map(|samples| samples.iter().map(|s| (s.timestamp, s.value)))
        .collect();
    if points.len() < 2 {
        return 0.0;
    }
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_x2: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denom = n * sum_x2 - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    // per-second slope scaled to an hourly rate
    (n * sum_xy - sum_x * sum_y) / denom * 3600.0
}

pub struct AiAssistedStrategy {
    common: StrategyCommon,
    client: Arc<dyn LlmClient>,
    /// Baseline parameters for the plausibility check.
    baseline_cpu_percentile: f64,
    baseline_memory_buffer: f64,
}

impl AiAssistedStrategy {
    pub fn new(common: StrategyCommon, client: Arc<dyn LlmClient>) -> Self {
        Self {
            common,
            client,
            baseline_cpu_percentile: 95.0,
            baseline_memory_buffer: 15.0,
        }
    }

    fn compose_prompt(&self, summary: &UsageSummary, ctx: &StrategyContext) -> String {
        serde_json::json!({
            "task": "Recommend Kubernetes container resources from usage statistics. \
                     Respond with a single JSON object: {cpu_request, cpu_limit|null, \
                     memory_request, memory_limit, confidence, reasoning}. CPU in cores, \
                     memory in bytes, confidence 0-100.",
            "workload": {
                "kind": ctx.workload.kind.as_str(),
                "namespace": ctx.workload.namespace,
                "name": ctx.workload.name,
                "container": ctx.container,
                "hpa": ctx.workload.hpa,
            },
            "current": ctx.current,
            "history_hours": ctx.history_hours,
            "usage": summary,
        })
        .to_string()
    }

    /// Clamp to the sanity bounds, flagging when the clamp fires.
    fn clamp(value: f64, min: f64, max: f64, clamped: &mut bool) -> f64 {
        let result = value.clamp(min, max);
        if result != value {
            *clamped = true;
        }
        result
    }
}

#[async_trait]
impl Strategy for AiAssistedStrategy {
    fn name(&self) -> &'static str {
        "ai-assisted"
    }

    fn required_metrics(&self) -> Vec<MetricQuery> {
        let mut metrics = vec![
            MetricQuery::plain(MetricKind::CpuUsage),
            MetricQuery::plain(MetricKind::MaxMemory),
            MetricQuery::plain(MetricKind::CpuPoints),
            MetricQuery::plain(MetricKind::MemoryPoints),
        ];
        if self.common.use_oomkill_data {
            metrics.push(MetricQuery::plain(MetricKind::OomKilledMemory));
        }
        metrics
    }

    async fn recommend(&self, bundle: &MetricBundle, ctx: &StrategyContext) -> Result<RunResult> {
        let total_points =
            bundle.total_points(MetricKind::CpuPoints) + bundle.total_points(MetricKind::MemoryPoints);
        if (total_points as u64) < self.common.points_required {
            return Ok(RunResult {
                cpu: ResourceProposal::undefined("Not enough data"),
                memory: ResourceProposal::undefined("Not enough data"),
            });
        }

        let cpu_blocked = ctx.hpa_targets(ResourceType::Cpu) && !self.common.allow_hpa;
        let memory_blocked = ctx.hpa_targets(ResourceType::Memory) && !self.common.allow_hpa;
        if cpu_blocked && memory_blocked {
            return Ok(RunResult {
                cpu: ResourceProposal::undefined("HPA detected"),
                memory: ResourceProposal::undefined("HPA detected"),
            });
        }

        let summary = UsageSummary::from_bundle(bundle);
        let prompt = self.compose_prompt(&summary, ctx);

        let answer = match self.client.recommend(&prompt).await {
            Ok(answer) => answer,
            Err(err) => {
                warn!(workload = %ctx.workload, error = %err, "LLM call failed");
                return Ok(RunResult {
                    cpu: ResourceProposal::undefined("AI error"),
                    memory: ResourceProposal::undefined("AI error"),
                });
            }
        };

        let mut clamped = false;
        let cpu_request = answer
            .cpu_request
            .map(|v| Self::clamp(v, CPU_MIN_CORES, CPU_MAX_CORES, &mut clamped));
        let cpu_limit = answer
            .cpu_limit
            .map(|v| Self::clamp(v, CPU_MIN_CORES, CPU_MAX_CORES, &mut clamped));
        let memory_request = answer
            .memory_request
            .map(|v| Self::clamp(v, MEMORY_MIN_BYTES, MEMORY_MAX_BYTES, &mut clamped));
        let memory_limit = answer
            .memory_limit
            .map(|v| Self::clamp(v, MEMORY_MIN_BYTES, MEMORY_MAX_BYTES, &mut clamped));

        let mut flags = Vec::new();
        if clamped {
            flags.push("clamped to bounds");
        }
        if deviates(cpu_request, summary.cpu_p95)
            || deviates(
                memory_request,
                summary.memory_max_bytes * (1.0 + self.baseline_memory_buffer / 100.0),
            )
        {
            debug!(
                workload = %ctx.workload,
                baseline_percentile = self.baseline_cpu_percentile,
                "AI answer deviates from the Simple baseline"
            );
            flags.push("deviates from baseline");
        }

        let reasoning = answer.reasoning.unwrap_or_default();
        let truncated: String = reasoning.chars().take(50).collect();
        let ellipsis = if reasoning.chars().count() > 50 { "..." } else { "" };
        let confidence = answer.confidence.unwrap_or(0.0);
        let mut info = format!("AI: {truncated}{ellipsis} (conf: {confidence:.0}%)");
        if !flags.is_empty() {
            info.push_str(&format!(" [{}]", flags.join(", ")));
        }

        let cpu = if cpu_blocked {
            ResourceProposal::undefined("HPA detected")
        } else {
            ResourceProposal {
                request: cpu_request.map(Proposal::Value).unwrap_or(Proposal::Undefined),
                // null cpu_limit means "leave unset"
                limit: cpu_limit.map(Proposal::Value).unwrap_or(Proposal::Unset),
                info: Some(info.clone()),
            }
        };
        let memory = if memory_blocked {
            ResourceProposal::undefined("HPA detected")
        } else {
            ResourceProposal {
                request: memory_request
                    .map(Proposal::Value)
                    .unwrap_or(Proposal::Undefined),
                limit: memory_limit
                    .map(Proposal::Value)
                    .unwrap_or(Proposal::Undefined),
                info: Some(info),
            }
        };

        Ok(RunResult { cpu, memory })
    }
}

fn deviates(value: Option<f64>, baseline: f64) -> bool {
    match value {
        Some(v) if baseline.is_finite() && baseline > 0.0 => {
            (v - baseline).abs() / baseline > DEVIATION_THRESHOLD
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HpaSpec;
    use crate::strategy::test_support::{bundle_with_points, sample_series, scalar_series, test_ctx};
    use std::sync::Mutex;

    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * MIB;

    struct StubLlm {
        answer: Mutex<Option<Result<LlmAnswer>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl StubLlm {
        fn with(answer: Result<LlmAnswer>) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn recommend(&self, prompt: &str) -> Result<LlmAnswer> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(LlmAnswer::default()))
        }
    }

    fn common() -> StrategyCommon {
        StrategyCommon {
            points_required: 100,
            allow_hpa: false,
            use_oomkill_data: true,
        }
    }

    fn busy_bundle() -> MetricBundle {
        let mut bundle = bundle_with_points(200.0, 200.0);
        bundle.insert(
            MetricKind::CpuUsage,
            sample_series("web-1", &[0.1, 0.12, 0.15, 0.2, 0.18, 0.11]),
        );
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 512.0 * MIB)]));
        bundle
    }

    fn answer(cpu: f64, memory: f64) -> LlmAnswer {
        LlmAnswer {
            cpu_request: Some(cpu),
            cpu_limit: None,
            memory_request: Some(memory),
            memory_limit: Some(memory),
            confidence: Some(85.0),
            reasoning: Some("usage is stable with small spikes".into()),
        }
    }

    #[tokio::test]
    async fn test_accepts_llm_answer() {
        let client = StubLlm::with(Ok(answer(0.2, 600.0 * MIB)));
        let strategy = AiAssistedStrategy::new(common(), client.clone());

        let result = strategy
            .recommend(&busy_bundle(), &test_ctx(None))
            .await
            .unwrap();

        assert_eq!(result.cpu.request, Proposal::Value(0.2));
        assert_eq!(result.cpu.limit, Proposal::Unset);
        assert_eq!(result.memory.request, Proposal::Value(600.0 * MIB));
        let info = result.cpu.info.unwrap();
        assert!(info.starts_with("AI: usage is stable"));
        assert!(info.contains("conf: 85%"));

        // the prompt carried the summary and the workload identity
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("\"name\":\"web\""));
        assert!(prompts[0].contains("cpu_p95"));
    }

    #[tokio::test]
    async fn test_clamps_out_of_range_values() {
        let client = StubLlm::with(Ok(answer(120.0, 512.0 * GIB)));
        let strategy = AiAssistedStrategy::new(common(), client);

        let result = strategy
            .recommend(&busy_bundle(), &test_ctx(None))
            .await
            .unwrap();

        assert_eq!(result.cpu.request, Proposal::Value(16.0));
        assert_eq!(result.memory.request, Proposal::Value(64.0 * GIB));
        assert!(result.cpu.info.unwrap().contains("clamped to bounds"));
    }

    #[tokio::test]
    async fn test_flags_deviation_from_baseline_but_returns_value() {
        // baseline memory is 512Mi * 1.15; ask for ~10x that
        let client = StubLlm::with(Ok(answer(0.2, 6.0 * GIB)));
        let strategy = AiAssistedStrategy::new(common(), client);

        let result = strategy
            .recommend(&busy_bundle(), &test_ctx(None))
            .await
            .unwrap();

        assert_eq!(result.memory.request, Proposal::Value(6.0 * GIB));
        assert!(result
            .memory
            .info
            .unwrap()
            .contains("deviates from baseline"));
    }

    #[tokio::test]
    async fn test_llm_failure_yields_undefined() {
        let client = StubLlm::with(Err(ScanError::Backend("llm down".into())));
        let strategy = AiAssistedStrategy::new(common(), client);

        let result = strategy
            .recommend(&busy_bundle(), &test_ctx(None))
            .await
            .unwrap();
        assert!(result.cpu.request.is_undefined());
        assert_eq!(result.cpu.info.as_deref(), Some("AI error"));
    }

    #[tokio::test]
    async fn test_points_gate_skips_llm_call() {
        let client = StubLlm::with(Ok(answer(0.2, 600.0 * MIB)));
        let strategy = AiAssistedStrategy::new(common(), client.clone());

        let bundle = bundle_with_points(10.0, 10.0);
        let result = strategy.recommend(&bundle, &test_ctx(None)).await.unwrap();

        assert!(result.cpu.request.is_undefined());
        assert!(client.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hpa_on_both_resources_skips_llm_call() {
        let client = StubLlm::with(Ok(answer(0.2, 600.0 * MIB)));
        let strategy = AiAssistedStrategy::new(common(), client.clone());

        let hpa = HpaSpec {
            min_replicas: Some(1),
            max_replicas: 3,
            target_cpu_utilization: Some(80.0),
            target_memory_utilization: Some(75.0),
        };
        let result = strategy
            .recommend(&busy_bundle(), &test_ctx(Some(hpa)))
            .await
            .unwrap();

        assert!(result.cpu.request.is_undefined());
        assert!(result.memory.request.is_undefined());
        assert!(client.prompts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_summary_statistics() {
        let bundle = busy_bundle();
        let summary = UsageSummary::from_bundle(&bundle);

        assert_eq!(summary.pods, 1);
        assert_eq!(summary.cpu_max, 0.2);
        assert!((summary.cpu_mean - 0.1433333333).abs() < 1e-6);
        assert!(summary.cpu_stddev > 0.0);
        assert_eq!(summary.memory_max_bytes, 512.0 * MIB);
        assert_eq!(summary.oom_killed_bytes, 0.0);
    }

    #[test]
    fn test_spike_count() {
        let mut values = vec![1.0; 50];
        values.push(100.0);
        let m = mean(&values);
        let sd = stddev(&values, m);
        assert_eq!(spike_count(&values, m, sd), 1);
        assert_eq!(spike_count(&[1.0, 1.0], 1.0, 0.0), 0);
    }

    #[test]
    fn test_trend_detects_growth() {
        let mut bundle = MetricBundle::new();
        let values: Vec<f64> = (0..100).map(|i| 0.1 + i as f64 * 0.001).collect();
        bundle.insert(MetricKind::CpuUsage, sample_series("web-1", &values));
        assert!(cpu_trend_per_hour(&bundle) > 0.0);

        let mut flat = MetricBundle::new();
        flat.insert(MetricKind::CpuUsage, sample_series("web-1", &[0.5, 0.5, 0.5]));
        assert!(cpu_trend_per_hour(&flat).abs() < 1e-9);
    }
}
