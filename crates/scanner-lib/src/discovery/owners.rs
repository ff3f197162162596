//! Owner resolution through kube-state-metrics
//!
//! Controllers that manage pods through an intermediate object
//! (Deployment -> ReplicaSet -> Pod) are resolved by querying the owner
//! series, so replicasets and pods deleted within the history window are
//! still found. Lookups are batched with regex OR joins to keep the query
//! count under backend rate limits.

use std::collections::HashSet;

use tracing::debug;

use crate::error::Result;
use crate::models::PodRef;
use crate::prometheus::MetricService;
use crate::query::duration_literal;

/// Which label carries the owned object's name in a `kube_*_owner` series.
fn subowner_label(subowner_kind: &str) -> &'static str {
    match subowner_kind {
        "ReplicaSet" => "replicaset",
        "ReplicationController" => "replicationcontroller",
        _ => "job_name",
    }
}

fn batches(names: &[String], batch_size: usize) -> Vec<String> {
    names
        .chunks(batch_size.max(1))
        .map(|chunk| {
            chunk
                .iter()
                .map(|name| regex::escape(name))
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect()
}

/// Names of ReplicaSets / ReplicationControllers / Jobs owned by the given
/// controllers. `None` when the dialect has no kube-state-metrics.
pub async fn lookup_subowners(
    metrics: &MetricService,
    subowner_kind: &str,
    owner_kind: &str,
    owner_names: &[String],
    namespace: &str,
    batch_size: usize,
) -> Result<Option<Vec<String>>> {
    let history = duration_literal(metrics.history());
    let label = subowner_label(subowner_kind);
    let mut found = Vec::new();

    for joined in batches(owner_names, batch_size) {
        let Some(query) = metrics.builder().subowner_names_query(
            subowner_kind,
            owner_kind,
            &joined,
            namespace,
            &history,
        ) else {
            return Ok(None);
        };

        let series = metrics.instant_query(&query).await?;
        for s in series {
            if let Some(name) = s.label(label) {
                found.push(name.to_string());
            }
        }
    }

    found.sort();
    found.dedup();
    debug!(
        owner_kind,
        subowner_kind,
        count = found.len(),
        "resolved subowners from metrics backend"
    );
    Ok(Some(found))
}

/// Pods owned by the given owners within the history window, flagged
/// deleted unless currently Running.
pub async fn lookup_pods(
    metrics: &MetricService,
    owner_kind: &str,
    owner_names: &[String],
    namespace: &str,
    batch_size: usize,
) -> Result<Option<Vec<PodRef>>> {
    let history = duration_literal(metrics.history());
    let mut pod_names = Vec::new();

    for joined in batches(owner_names, batch_size) {
        let Some(query) =
            metrics
                .builder()
                .pod_owners_query(owner_kind, &joined, namespace, &history)
        else {
            return Ok(None);
        };

        let series = metrics.instant_query(&query).await?;
        for s in series {
            if let Some(pod) = s.label("pod") {
                pod_names.push(pod.to_string());
            }
        }
    }

    pod_names.sort();
    pod_names.dedup();
    if pod_names.is_empty() {
        return Ok(Some(Vec::new()));
    }

    let running = running_pods(metrics, &pod_names, namespace, batch_size)
        .await?
        .unwrap_or_default();

    Ok(Some(
        pod_names
            .into_iter()
            .map(|name| {
                let deleted = !running.contains(&name);
                PodRef { name, deleted }
            })
            .collect(),
    ))
}

/// Which of the given pods are currently in the Running phase.
pub async fn running_pods(
    metrics: &MetricService,
    pod_names: &[String],
    namespace: &str,
    batch_size: usize,
) -> Result<Option<HashSet<String>>> {
    let mut running = HashSet::new();

    for joined in batches(pod_names, batch_size) {
        let Some(query) = metrics.builder().running_pods_query(&joined, namespace) else {
            return Ok(None);
        };

        let series = metrics.instant_query(&query).await?;
        for s in series {
            if let Some(pod) = s.label("pod") {
                running.insert(pod.to_string());
            }
        }
    }

    Ok(Some(running))
}
