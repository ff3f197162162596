//! The Simple strategy
//!
//! CPU request is the configured percentile of usage (computed per pod by
//! the backend, max taken across pods), CPU limit stays unset. Memory
//! request and limit are the peak working set plus a buffer, overridden
//! by the OOM-kill limit plus its own buffer when an OOM was seen.

use async_trait::async_trait;

use super::{
    cpu_gate, memory_recommendation, MetricQuery, Proposal, ResourceProposal, RunResult,
    Strategy, StrategyContext,
};
use crate::config::{SimpleSettings, StrategyCommon};
use crate::error::Result;
use crate::models::{MetricBundle, MetricKind};

pub struct SimpleStrategy {
    settings: SimpleSettings,
    common: StrategyCommon,
}

impl SimpleStrategy {
    pub fn new(settings: SimpleSettings, common: StrategyCommon) -> Self {
        Self { settings, common }
    }

    fn cpu_proposal(&self, bundle: &MetricBundle, ctx: &StrategyContext) -> ResourceProposal {
        if let Some(gated) = cpu_gate(bundle, MetricKind::CpuPercentile, ctx, &self.common) {
            return gated;
        }

        // one percentile scalar per pod; the recommendation covers the
        // hungriest pod
        let cpu = bundle
            .max_over_pods(MetricKind::CpuPercentile)
            .unwrap_or(f64::NAN);
        if !cpu.is_finite() {
            return ResourceProposal::undefined("No data");
        }

        ResourceProposal {
            request: Proposal::Value(cpu),
            limit: Proposal::Unset,
            info: None,
        }
    }
}

#[async_trait]
impl Strategy for SimpleStrategy {
    fn name(&self) -> &'static str {
        "simple"
    }

    fn required_metrics(&self) -> Vec<MetricQuery> {
        let mut metrics = vec![
            MetricQuery::percentile(MetricKind::CpuPercentile, self.settings.cpu_percentile),
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
    use crate::models::{HpaSpec, MetricKind};
    use crate::strategy::test_support::{bundle_with_points, scalar_series, test_ctx};

    const MIB: f64 = 1024.0 * 1024.0;

    fn common() -> StrategyCommon {
        StrategyCommon {
            points_required: 100,
            allow_hpa: false,
            use_oomkill_data: true,
        }
    }

    fn strategy() -> SimpleStrategy {
        SimpleStrategy::new(SimpleSettings::default(), common())
    }

    /// Buffer math goes through floating point; compare within a byte.
    fn assert_bytes(proposal: &Proposal, expected: f64) {
        let value = proposal.value().expect("expected a concrete value");
        assert!((value - expected).abs() < 1.0, "got {value}, want {expected}");
    }

    /// One deployment, one container, no HPA, no OOM. The backend computed
    /// the per-pod p95 of the CPU rate; memory peaked at 700Mi.
    fn healthy_bundle() -> MetricBundle {
        let mut bundle = bundle_with_points(300.0, 300.0);
        bundle.insert(MetricKind::CpuPercentile, scalar_series(&[("web-1", 0.19)]));
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 700.0 * MIB)]));
        bundle
    }

    #[tokio::test]
    async fn test_basic_recommendation() {
        let result = strategy()
            .recommend(&healthy_bundle(), &test_ctx(None))
            .await
            .unwrap();

        assert_eq!(result.cpu.request, Proposal::Value(0.19));
        assert_eq!(result.cpu.limit, Proposal::Unset);

        let expected = 700.0 * MIB * 1.15;
        assert_bytes(&result.memory.request, expected);
        assert_eq!(result.memory.request, result.memory.limit);
        assert_eq!(result.memory.info, None);
    }

    #[tokio::test]
    async fn test_oomkill_overrides_plain_maximum() {
        let mut bundle = healthy_bundle();
        bundle.insert(
            MetricKind::OomKilledMemory,
            scalar_series(&[("web-1", 1024.0 * MIB)]),
        );

        let result = strategy()
            .recommend(&bundle, &test_ctx(None))
            .await
            .unwrap();

        // 1Gi * 1.25 = 1280Mi, replacing 700Mi * 1.15
        let expected = 1024.0 * MIB * 1.25;
        assert_bytes(&result.memory.request, expected);
        assert_eq!(result.memory.request, result.memory.limit);
        assert_eq!(result.memory.info.as_deref(), Some("OOMKill detected"));
    }

    #[tokio::test]
    async fn test_oomkill_ignored_when_disabled() {
        let mut bundle = healthy_bundle();
        bundle.insert(
            MetricKind::OomKilledMemory,
            scalar_series(&[("web-1", 1024.0 * MIB)]),
        );

        let mut common = common();
        common.use_oomkill_data = false;
        let strategy = SimpleStrategy::new(SimpleSettings::default(), common);

        let result = strategy.recommend(&bundle, &test_ctx(None)).await.unwrap();
        assert_bytes(&result.memory.request, 700.0 * MIB * 1.15);
    }

    #[tokio::test]
    async fn test_hpa_on_cpu_blocks_cpu_only() {
        let hpa = HpaSpec {
            min_replicas: Some(1),
            max_replicas: 5,
            target_cpu_utilization: Some(80.0),
            target_memory_utilization: None,
        };
        let result = strategy()
            .recommend(&healthy_bundle(), &test_ctx(Some(hpa)))
            .await
            .unwrap();

        assert!(result.cpu.request.is_undefined());
        assert_eq!(result.cpu.info.as_deref(), Some("HPA detected"));
        // memory not targeted by the HPA, still recommended
        assert_bytes(&result.memory.request, 700.0 * MIB * 1.15);
    }

    #[tokio::test]
    async fn test_hpa_allowed_when_configured() {
        let hpa = HpaSpec {
            min_replicas: Some(1),
            max_replicas: 5,
            target_cpu_utilization: Some(80.0),
            target_memory_utilization: Some(70.0),
        };
        let mut common = common();
        common.allow_hpa = true;
        let strategy = SimpleStrategy::new(SimpleSettings::default(), common);

        let result = strategy
            .recommend(&healthy_bundle(), &test_ctx(Some(hpa)))
            .await
            .unwrap();
        assert_eq!(result.cpu.request, Proposal::Value(0.19));
        assert!(matches!(result.memory.request, Proposal::Value(_)));
    }

    #[tokio::test]
    async fn test_not_enough_points() {
        let mut bundle = bundle_with_points(40.0, 50.0);
        bundle.insert(MetricKind::CpuPercentile, scalar_series(&[("web-1", 0.19)]));
        bundle.insert(MetricKind::MaxMemory, scalar_series(&[("web-1", 700.0 * MIB)]));

        let result = strategy()
            .recommend(&bundle, &test_ctx(None))
            .await
            .unwrap();
        assert!(result.cpu.request.is_undefined());
        assert_eq!(result.cpu.info.as_deref(), Some("Not enough data"));
        assert!(result.memory.request.is_undefined());
        assert_eq!(result.memory.info.as_deref(), Some("Not enough data"));
    }

    #[tokio::test]
    async fn test_points_pool_across_pods() {
        // 60 + 55 points clears the 100-point gate
        let mut bundle = MetricBundle::new();
        bundle.insert(
            MetricKind::CpuPoints,
            scalar_series(&[("web-1", 60.0), ("web-2", 55.0)]),
        );
        bundle.insert(
            MetricKind::MemoryPoints,
            scalar_series(&[("web-1", 60.0), ("web-2", 55.0)]),
        );
        bundle.insert(
            MetricKind::CpuPercentile,
            scalar_series(&[("web-1", 0.1), ("web-2", 0.3)]),
        );
        bundle.insert(
            MetricKind::MaxMemory,
            scalar_series(&[("web-1", 400.0 * MIB), ("web-2", 600.0 * MIB)]),
        );

        let result = strategy()
            .recommend(&bundle, &test_ctx(None))
            .await
            .unwrap();
        // hungriest pod wins for both resources
        assert_eq!(result.cpu.request, Proposal::Value(0.3));
        assert_bytes(&result.memory.request, 600.0 * MIB * 1.15);
    }

    #[tokio::test]
    async fn test_empty_bundle_is_undefined() {
        let result = strategy()
            .recommend(&MetricBundle::new(), &test_ctx(None))
            .await
            .unwrap();
        assert!(result.cpu.request.is_undefined());
        assert!(result.memory.request.is_undefined());
        assert_eq!(result.cpu.info.as_deref(), Some("No data"));
    }

    #[tokio::test]
    async fn test_memory_buffer_is_monotone() {
        let mut previous = 0.0;
        for buffer in [5.0, 15.0, 30.0, 60.0] {
            let settings = SimpleSettings {
                memory_buffer_percentage: buffer,
                ..SimpleSettings::default()
            };
            let strategy = SimpleStrategy::new(settings, common());
            let result = strategy
                .recommend(&healthy_bundle(), &test_ctx(None))
                .await
                .unwrap();
            let value = result.memory.request.value().unwrap();
            assert!(value > previous, "buffer {buffer} did not increase memory");
            previous = value;
        }
    }

    #[tokio::test]
    async fn test_determinism() {
        let strategy = strategy();
        let bundle = healthy_bundle();
        let ctx = test_ctx(None);

        let first = strategy.recommend(&bundle, &ctx).await.unwrap();
        for _ in 0..5 {
            let again = strategy.recommend(&bundle, &ctx).await.unwrap();
            assert_eq!(first, again);
        }
    }
}
