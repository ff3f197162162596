//! Recommendation strategies
//!
//! A strategy declares which metric kinds it needs and turns a completed
//! bundle into per-resource proposals. Proposals stay in floating-point
//! cores and bytes; rounding to integer millicores and bytes happens at
//! the runner's output boundary.

mod ai;
mod simple;
mod simple_limit;

pub use ai::{AiAssistedStrategy, HttpLlmClient, LlmAnswer, LlmClient};
pub use simple::SimpleStrategy;
pub use simple_limit::SimpleLimitStrategy;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StrategyCommon;
use crate::error::Result;
use crate::models::{
    MetricBundle, MetricKind, ResourceAllocations, ResourceType, Workload,
};

/// One metric the strategy wants fetched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricQuery {
    pub kind: MetricKind,
    pub percentile: Option<f64>,
}

impl MetricQuery {
    pub fn plain(kind: MetricKind) -> Self {
        Self {
            kind,
            percentile: None,
        }
    }

    pub fn percentile(kind: MetricKind, percentile: f64) -> Self {
        Self {
            kind,
            percentile: Some(percentile),
        }
    }
}

/// Workload context handed to a strategy alongside the bundle.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub workload: Arc<Workload>,
    pub container: String,
    pub current: ResourceAllocations,
    pub cpu_min_cores: f64,
    pub memory_min_bytes: f64,
    pub history_hours: f64,
}

impl StrategyContext {
    /// Whether an HPA both exists and targets the given resource.
    pub fn hpa_targets(&self, resource: ResourceType) -> bool {
        self.workload
            .hpa
            .as_ref()
            .map(|hpa| hpa.targets(resource))
            .unwrap_or(false)
    }
}

/// A proposed value for one field, in cores or bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proposal {
    Value(f64),
    /// The field should deliberately stay unset.
    Unset,
    /// No recommendation could be made.
    Undefined,
}

impl Proposal {
    pub fn value(&self) -> Option<f64> {
        match self {
            Proposal::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Proposal::Undefined)
    }
}

/// Request and limit proposals for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceProposal {
    pub request: Proposal,
    pub limit: Proposal,
    pub info: Option<String>,
}

impl ResourceProposal {
    pub fn undefined(info: impl Into<String>) -> Self {
        Self {
            request: Proposal::Undefined,
            limit: Proposal::Undefined,
            info: Some(info.into()),
        }
    }
}

/// What a strategy returns for one container slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub cpu: ResourceProposal,
    pub memory: ResourceProposal,
}

/// A pluggable recommendation policy. Pure: identical inputs produce
/// identical outputs (the AI variant is pure modulo its injected client).
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Metric kinds the runner must fetch before calling [`recommend`].
    fn required_metrics(&self) -> Vec<MetricQuery>;

    async fn recommend(&self, bundle: &MetricBundle, ctx: &StrategyContext) -> Result<RunResult>;
}

/// Percentile with linear interpolation between closest ranks. NaN on an
/// empty slice.
pub(crate) fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = (p / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
    }
}

/// Shared gating for the CPU side: empty data, too few points, or an HPA
/// on CPU each yield an undefined proposal.
pub(crate) fn cpu_gate(
    bundle: &MetricBundle,
    data_kind: MetricKind,
    ctx: &StrategyContext,
    common: &StrategyCommon,
) -> Option<ResourceProposal> {
    if bundle.is_empty(data_kind) {
        return Some(ResourceProposal::undefined("No data"));
    }
    if (bundle.total_points(MetricKind::CpuPoints) as u64) < common.points_required {
        return Some(ResourceProposal::undefined("Not enough data"));
    }
    if ctx.hpa_targets(ResourceType::Cpu) && !common.allow_hpa {
        return Some(ResourceProposal::undefined("HPA detected"));
    }
    None
}

/// Memory recommendation shared by the Simple family: max working set
/// plus a buffer, overridden by the OOM-kill limit plus its own buffer
/// whenever an OOM event was observed. Request equals limit.
pub(crate) fn memory_recommendation(
    bundle: &MetricBundle,
    ctx: &StrategyContext,
    common: &StrategyCommon,
    buffer_percentage: f64,
    oom_buffer_percentage: f64,
) -> ResourceProposal {
    let oom_max = if common.use_oomkill_data {
        bundle
            .max_over_pods(MetricKind::OomKilledMemory)
            .unwrap_or(0.0)
    } else {
        0.0
    };

    if bundle.is_empty(MetricKind::MaxMemory) {
        return ResourceProposal::undefined("No data");
    }
    if (bundle.total_points(MetricKind::MemoryPoints) as u64) < common.points_required {
        return ResourceProposal::undefined("Not enough data");
    }
    if ctx.hpa_targets(ResourceType::Memory) && !common.allow_hpa {
        return ResourceProposal::undefined("HPA detected");
    }

    let value = if oom_max > 0.0 {
        oom_max * (1.0 + oom_buffer_percentage / 100.0)
    } else {
        let max_memory = bundle
            .max_over_pods(MetricKind::MaxMemory)
            .unwrap_or(f64::NAN);
        max_memory * (1.0 + buffer_percentage / 100.0)
    };

    ResourceProposal {
        request: Proposal::Value(value),
        limit: Proposal::Value(value),
        info: (oom_max > 0.0).then(|| "OOMKill detected".to_string()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::{PodSeries, Sample, Workload, WorkloadKind};
    use std::collections::{BTreeMap, BTreeSet};

    pub fn test_workload(hpa: Option<crate::models::HpaSpec>) -> Arc<Workload> {
        Arc::new(Workload {
            cluster: "test".into(),
            namespace: "default".into(),
            kind: WorkloadKind::Deployment,
            name: "web".into(),
            containers: vec![],
            pods: vec![crate::models::PodRef::alive("web-1")],
            hpa,
            warnings: BTreeSet::new(),
            labels: BTreeMap::new(),
        })
    }

    pub fn test_ctx(hpa: Option<crate::models::HpaSpec>) -> StrategyContext {
        StrategyContext {
            workload: test_workload(hpa),
            container: "main".into(),
            current: ResourceAllocations::default(),
            cpu_min_cores: 0.01,
            memory_min_bytes: 100.0 * 1024.0 * 1024.0,
            history_hours: 336.0,
        }
    }

    pub fn scalar_series(pairs: &[(&str, f64)]) -> PodSeries {
        pairs
            .iter()
            .map(|(pod, value)| (pod.to_string(), vec![Sample::new(0.0, *value)]))
            .collect()
    }

    pub fn sample_series(pod: &str, values: &[f64]) -> PodSeries {
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| Sample::new(i as f64 * 75.0, *v))
            .collect();
        [(pod.to_string(), samples)].into_iter().collect()
    }

    /// A bundle that passes the points gates with plausible counts.
    pub fn bundle_with_points(cpu_points: f64, memory_points: f64) -> MetricBundle {
        let mut bundle = MetricBundle::new();
        bundle.insert(MetricKind::CpuPoints, scalar_series(&[("web-1", cpu_points)]));
        bundle.insert(
            MetricKind::MemoryPoints,
            scalar_series(&[("web-1", memory_points)]),
        );
        bundle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates_linearly() {
        let values = [0.1, 0.1, 0.12, 0.15, 0.2];
        // rank 0.95 * 4 = 3.8 -> 0.15 + 0.8 * 0.05
        let p95 = percentile(&values, 95.0);
        assert!((p95 - 0.19).abs() < 1e-12, "p95 was {p95}");

        assert_eq!(percentile(&values, 0.0), 0.1);
        assert_eq!(percentile(&values, 100.0), 0.2);
        assert_eq!(percentile(&[7.0], 50.0), 7.0);
        assert!(percentile(&[], 95.0).is_nan());
    }

    #[test]
    fn test_percentile_is_order_independent() {
        let a = [5.0, 1.0, 3.0, 2.0, 4.0];
        let b = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&a, 66.0), percentile(&b, 66.0));
    }
}
