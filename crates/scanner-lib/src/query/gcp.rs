//! GCP Managed Prometheus and Anthos query generation
//!
//! GCP metric names contain slashes, so every selector uses the UTF-8
//! braced form with a quoted `__name__`. Labels are `namespace_name`,
//! `pod_name` and `container_name`, and every selector must carry
//! `monitored_resource="k8s_container"`. Results are wrapped in two
//! `label_replace` calls so callers see the standard `pod` and `container`
//! labels.
//!
//! Neither backend exposes the terminated-reason series, so the OOM signal
//! is inferred: memory limit multiplied by restart count. Any restart of a
//! container with a limit therefore reads as an OOM event; callers are
//! expected to surface that caveat.

use super::SlotSelector;
use crate::models::MetricKind;

pub(super) const CONTAINER_PREFIX: &str = "kubernetes.io/container";
pub(super) const ANTHOS_PREFIX: &str = "kubernetes.io/anthos/container";

fn selector(metric: &str, slot: &SlotSelector<'_>, cluster: &str) -> String {
    format!(
        "{{\"__name__\"=\"{metric}\", \"monitored_resource\"=\"k8s_container\", \
         \"namespace_name\"=\"{}\", \"pod_name\"=~\"{}\", \"container_name\"=\"{}\"{}}}",
        slot.namespace,
        slot.pods_regex(),
        slot.container,
        cluster
    )
}

/// Rename `pod_name`/`container_name` back to the standard label names.
fn normalize(expr: String) -> String {
    format!(
        "label_replace(label_replace({expr}, \"pod\", \"$1\", \"pod_name\", \"(.+)\"), \
         \"container\", \"$1\", \"container_name\", \"(.+)\")"
    )
}

pub(super) fn metric_query(
    prefix: &str,
    kind: MetricKind,
    slot: &SlotSelector<'_>,
    cluster: &str,
    history: &str,
    step: &str,
    percentile: Option<f64>,
) -> String {
    let cpu = format!("{prefix}/cpu/core_usage_time");
    let memory = format!("{prefix}/memory/used_bytes");

    let expr = match kind {
        MetricKind::CpuUsage => format!(
            "max by (container_name, pod_name, job) (rate({}[{step}]))",
            selector(&cpu, slot, cluster)
        ),
        MetricKind::CpuPercentile => {
            let q = format!("{:.2}", percentile.unwrap_or(95.0) / 100.0);
            format!(
                "quantile_over_time({q}, max by (container_name, pod_name, job) (rate({}[{step}]))[{history}:{step}])",
                selector(&cpu, slot, cluster)
            )
        }
        MetricKind::CpuPoints => format!(
            "count_over_time(max by (container_name, pod_name, job) ({})[{history}:{step}])",
            selector(&cpu, slot, cluster)
        ),
        MetricKind::Memory => format!(
            "max by (container_name, pod_name, job) ({})",
            selector(&memory, slot, cluster)
        ),
        MetricKind::MaxMemory => format!(
            "max_over_time(max by (container_name, pod_name, job) ({})[{history}:{step}])",
            selector(&memory, slot, cluster)
        ),
        MetricKind::MemoryPoints => format!(
            "count_over_time(max by (container_name, pod_name, job) ({})[{history}:{step}])",
            selector(&memory, slot, cluster)
        ),
        MetricKind::OomKilledMemory => {
            let limit = format!("{prefix}/memory/limit_bytes");
            let restarts = format!("{prefix}/restart_count");
            format!(
                "max_over_time((max by (pod_name, container_name, job) ({}) \
                 * on(pod_name, container_name, job) group_left() \
                 max by (pod_name, container_name, job) ({}))[{history}:{step}])",
                selector(&limit, slot, cluster),
                selector(&restarts, slot, cluster)
            )
        }
    };

    normalize(expr)
}
