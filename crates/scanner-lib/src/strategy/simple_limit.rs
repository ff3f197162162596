//! The Simple-Limit strategy
//!
//! Same memory policy as Simple, but CPU is computed client-side from the
//! full usage series: the request is one percentile, the limit a higher
//! one. Used where limits are mandated by policy.

use async_trait::async_trait;

use super::{
    cpu_gate, memory_recommendation, percentile, MetricQuery, Proposal, ResourceProposal,
    RunResult, Strategy, StrategyContext,
};
use crate::config::{SimpleLimitSettings, StrategyCommon};
use crate::error::Result;
use crate::models::{MetricBundle, MetricKind};

pub struct SimpleLimitStrategy {
    settings: SimpleLimitSettings,
    common: StrategyCommon,
}

impl SimpleLimitStrategy {
    pub fn new(settings: SimpleLimitSettings, common: StrategyCommon) -> Self {
        Self { settings, common }
    }

    fn cpu_proposal(&self, bundle: &MetricBundle, ctx: &StrategyContext) -> ResourceProposal {
        if let Some(gated) = cpu_gate(bundle, MetricKind::CpuUsage, ctx, &self.common) {
            return gated;
        }

        let samples = bundle.pooled_values(MetricKind::CpuUsage);
        let request = percentile(&samples, self.settings.cpu_request_percentile);
        let limit = percentile(&samples, self.settings.cpu_limit_percentile);
        if !request.is_finite() || !limit.is_finite() {
            return ResourceProposal::undefined("No data");
        }

        ResourceProposal {
            request: Proposal::Value(request),
            limit: Proposal::Value(limit),
            info: None,
        }
    }
}

#[async_trait]
impl Strategy for SimpleLimitStrategy {
    fn name(&self) -> &'static str {
        "simple-limit"
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
        Ok(RunResult {
            cpu: self.cpu_proposal(bundle, ctx),
            memory: memory_recommendation(
                bundle,
                ctx,
                &self.common,
                self.settings.memory_buffer_percentage,
                self.settings.oom_memory_buffer_percentage,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{bundle_with_points, sample_series, scalar_series, test_ctx};

    const MIB: f64 = 1024.0 * 1024.0;

    fn common() -> StrategyCommon {
        StrategyCommon {
            points_required: 100,
            allow_hpa: false,
            use_oomkill_data: true,
        }
    }

    #[tokio::test]
    async fn test_request_and_limit_use_separate_percentiles() {
        let mut bundle = bundle_with_points(200.0, 200.0);
        let samples: Vec<f64> = (1..=100).map(|i| i as f64 / 100.0).collect();
        bundle.insert(MetricKind::CpuUsage, sample_series("web-1", &samples));
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 500.0 * MIB)]));

        let strategy = SimpleLimitStrategy::new(SimpleLimitSettings::default(), common());
        let result = strategy
            .recommend(&bundle, &test_ctx(None))
            .await
            .unwrap();

        let request = result.cpu.request.value().unwrap();
        let limit = result.cpu.limit.value().unwrap();
        // p66 of 0.01..=1.00 with linear interpolation
        assert!((request - 0.6634).abs() < 1e-9, "request was {request}");
        assert!((limit - 0.9604).abs() < 1e-9, "limit was {limit}");
        assert!(limit > request);
    }

    #[tokio::test]
    async fn test_limit_percentile_never_below_request_percentile() {
        let mut bundle = bundle_with_points(150.0, 150.0);
        bundle.insert(
            MetricKind::CpuUsage,
            sample_series("web-1", &[0.2, 0.9, 0.4, 0.1, 0.5, 0.3, 0.8, 0.6, 0.7, 1.0]),
        );
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 100.0 * MIB)]));

        let strategy = SimpleLimitStrategy::new(SimpleLimitSettings::default(), common());
        let result = strategy.recommend(&bundle, &test_ctx(None)).await.unwrap();
        assert!(result.cpu.limit.value().unwrap() >= result.cpu.request.value().unwrap());
    }

    #[tokio::test]
    async fn test_memory_matches_simple_policy() {
        let mut bundle = bundle_with_points(200.0, 200.0);
        bundle.insert(MetricKind::CpuUsage, sample_series("web-1", &[0.1, 0.2]));
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 700.0 * MIB)]));
        bundle.insert(
            MetricKind::OomKilledMemory,
            scalar_series(&[("web-1", 1024.0 * MIB)]),
        );

        let strategy = SimpleLimitStrategy::new(SimpleLimitSettings::default(), common());
        let result = strategy.recommend(&bundle, &test_ctx(None)).await.unwrap();
        let value = result.memory.request.value().unwrap();
        assert!((value - 1024.0 * MIB * 1.25).abs() < 1.0);
        assert_eq!(result.memory.info.as_deref(), Some("OOMKill detected"));
    }

    #[tokio::test]
    async fn test_points_gate() {
        let mut bundle = bundle_with_points(10.0, 10.0);
        bundle.insert(MetricKind::CpuUsage, sample_series("web-1", &[0.1, 0.2]));
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 100.0 * MIB)]));

        let strategy = SimpleLimitStrategy::new(SimpleLimitSettings::default(), common());
        let result = strategy.recommend(&bundle, &test_ctx(None)).await.unwrap();
        assert!(result.cpu.request.is_undefined());
        assert!(result.memory.request.is_undefined());
    }
}
