//! Classic Prometheus query generation
//!
//! Metric names come from cAdvisor (`container_*`) and kube-state-metrics
//! (`kube_*`). Series are aggregated `by (container, pod, job)` so one
//! series per pod survives even when several scrape jobs report it.

use super::SlotSelector;
use crate::models::MetricKind;

const CPU_USAGE: &str = "container_cpu_usage_seconds_total";
const MEMORY_WORKING_SET: &str = "container_memory_working_set_bytes";
const LAST_TERMINATED_REASON: &str = "kube_pod_container_status_last_terminated_reason";
const RESOURCE_LIMITS: &str = "kube_pod_container_resource_limits";

fn matchers(slot: &SlotSelector<'_>, cluster: &str) -> String {
    format!(
        "namespace=\"{}\", pod=~\"{}\", container=\"{}\"{}",
        slot.namespace,
        slot.pods_regex(),
        slot.container,
        cluster
    )
}

pub(super) fn metric_query(
    kind: MetricKind,
    slot: &SlotSelector<'_>,
    cluster: &str,
    history: &str,
    step: &str,
    percentile: Option<f64>,
) -> String {
    let m = matchers(slot, cluster);
    match kind {
        MetricKind::CpuUsage => {
            format!("max by (container, pod, job) (rate({CPU_USAGE}{{{m}}}[{step}]))")
        }
        MetricKind::CpuPercentile => {
            let q = format!("{:.2}", percentile.unwrap_or(95.0) / 100.0);
            format!(
                "quantile_over_time({q}, max by (container, pod, job) (rate({CPU_USAGE}{{{m}}}[{step}]))[{history}:{step}])"
            )
        }
        MetricKind::CpuPoints => {
            format!(
                "count_over_time(max by (container, pod, job) ({CPU_USAGE}{{{m}}})[{history}:{step}])"
            )
        }
        MetricKind::Memory => {
            format!("max by (container, pod, job) ({MEMORY_WORKING_SET}{{{m}}})")
        }
        MetricKind::MaxMemory => {
            format!(
                "max_over_time(max by (container, pod, job) ({MEMORY_WORKING_SET}{{{m}}})[{history}:{step}])"
            )
        }
        MetricKind::MemoryPoints => {
            format!(
                "count_over_time(max by (container, pod, job) ({MEMORY_WORKING_SET}{{{m}}})[{history}:{step}])"
            )
        }
        MetricKind::OomKilledMemory => oom_killed_memory(slot, cluster, history, step),
    }
}

/// The memory limit in force at the most recent OOM kill. The terminated
/// reason series flags the kill, the limits series carries the value; the
/// join keeps only pods that actually OOMed.
fn oom_killed_memory(slot: &SlotSelector<'_>, cluster: &str, history: &str, step: &str) -> String {
    let reason = format!(
        "reason=\"OOMKilled\", {}",
        matchers(slot, cluster)
    );
    let limits = format!(
        "resource=\"memory\", {}",
        matchers(slot, cluster)
    );
    format!(
        "max_over_time((max by (pod, container, job) ({LAST_TERMINATED_REASON}{{{reason}}}) \
         * on(pod, container, job) group_left() \
         max by (pod, container, job) ({RESOURCE_LIMITS}{{{limits}}}))[{history}:{step}])"
    )
}

pub(super) fn subowner_names_query(
    subowner_kind: &str,
    owner_kind: &str,
    owner_names_regex: &str,
    namespace: &str,
    cluster: &str,
    history: &str,
) -> String {
    // kube_job_owner labels the owned object "job_name" instead of "job"
    let metric = match subowner_kind {
        "Job" => "kube_job_owner".to_string(),
        other => format!("kube_{}_owner", other.to_lowercase()),
    };
    format!(
        "last_over_time({metric}{{owner_name=~\"{owner_names_regex}\", owner_kind=\"{owner_kind}\", namespace=\"{namespace}\"{cluster}}}[{history}])"
    )
}

pub(super) fn pod_owners_query(
    owner_kind: &str,
    owner_names_regex: &str,
    namespace: &str,
    cluster: &str,
    history: &str,
) -> String {
    format!(
        "last_over_time(kube_pod_owner{{owner_name=~\"{owner_names_regex}\", owner_kind=\"{owner_kind}\", namespace=\"{namespace}\"{cluster}}}[{history}])"
    )
}

pub(super) fn running_pods_query(pods_regex: &str, namespace: &str, cluster: &str) -> String {
    format!(
        "kube_pod_status_phase{{phase=\"Running\", namespace=\"{namespace}\", pod=~\"{pods_regex}\"{cluster}}} == 1"
    )
}
