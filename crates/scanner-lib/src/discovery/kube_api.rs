//! Kubernetes API workload discovery
//!
//! Lists the built-in controller kinds through typed APIs and the CRD
//! kinds (Rollout, DeploymentConfig, StrimziPodSet) through
//! `DynamicObject`. List calls are paged with a bounded page count. Jobs
//! owned by a CronJob are suppressed, and Jobs sharing the configured
//! grouping label keys fold into synthetic GroupedJob workloads.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ApiResource, DynamicObject, ListParams};
use kube::core::GroupVersionKind;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::owners;
use super::{DiscoveryFilter, WorkloadSource};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::models::{
    ContainerSpec, HpaSpec, PodRef, ResourceAllocations, ScanWarning, Workload, WorkloadKind,
};
use crate::prometheus::MetricService;
use crate::quantity;

type HpaIndex = BTreeMap<(String, String, String), HpaSpec>;

/// A listed workload before pod resolution.
#[derive(Debug, Clone)]
struct RawWorkload {
    kind: WorkloadKind,
    namespace: String,
    name: String,
    labels: BTreeMap<String, String>,
    containers: Vec<ContainerSpec>,
    /// Label selector used for the live-API pod fallback.
    selector: Option<String>,
    /// The kind that directly owns the pods.
    pod_owner_kind: &'static str,
    /// Owner names to resolve pods through. For most kinds this is the
    /// workload itself; for grouped jobs it is the member list.
    pod_owner_names: Vec<String>,
    /// Whether pod owners must be resolved through an intermediate
    /// generation (ReplicaSet / ReplicationController / Job) first.
    needs_subowner_lookup: bool,
}

/// Discovers workloads of one cluster through its Kubernetes API.
pub struct KubeDiscoverer {
    cluster: String,
    client: kube::Client,
    metrics: Option<Arc<MetricService>>,
    filter: DiscoveryFilter,
    config: Arc<ScanConfig>,
}

impl KubeDiscoverer {
    pub fn new(
        cluster: impl Into<String>,
        client: kube::Client,
        metrics: Option<Arc<MetricService>>,
        filter: DiscoveryFilter,
        config: Arc<ScanConfig>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            client,
            metrics,
            filter,
            config,
        }
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(selector) = &self.filter.selector {
            params = params.labels(selector);
        }
        params
    }

    async fn list_paged<K>(&self, api: Api<K>) -> Result<Vec<K>>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        let mut items = Vec::new();
        let mut token: Option<String> = None;

        for page in 0..self.config.max_list_pages {
            let mut params = self.list_params().limit(self.config.list_page_size);
            if let Some(token) = &token {
                params = params.continue_token(token);
            }

            let list = api.list(&params).await?;
            items.extend(list.items);
            token = list.metadata.continue_.filter(|t| !t.is_empty());

            if token.is_none() {
                break;
            }
            if page + 1 == self.config.max_list_pages {
                warn!(
                    pages = self.config.max_list_pages,
                    "pagination circuit breaker tripped, result may be incomplete"
                );
            }
        }
        Ok(items)
    }

    async fn list_dynamic(&self, group: &str, version: &str, kind: &str) -> Result<Vec<DynamicObject>> {
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);

        match self.list_paged(api).await {
            Ok(items) => Ok(items),
            Err(ScanError::Backend(msg)) if msg.contains("404") || msg.contains("NotFound") => {
                debug!(kind, "CRD not installed, skipping");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn list_hpas(&self) -> Result<HpaIndex> {
        let api: Api<HorizontalPodAutoscaler> = Api::all(self.client.clone());
        let list = self.list_paged(api).await?;
        let mut index = HpaIndex::new();
        for hpa in &list {
            if let Some((key, spec)) = hpa_entry(hpa) {
                index.insert(key, spec);
            }
        }
        debug!(count = index.len(), "indexed HPAs by scale target");
        Ok(index)
    }

    async fn collect_kind(&self, kind: WorkloadKind) -> Result<Vec<RawWorkload>> {
        match kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::all(self.client.clone());
                Ok(self
                    .list_paged(api)
                    .await?
                    .iter()
                    .filter_map(|d| {
                        let spec = d.spec.as_ref()?;
                        raw_workload(
                            WorkloadKind::Deployment,
                            d.metadata.name.as_deref()?,
                            d.metadata.namespace.as_deref()?,
                            d.metadata.labels.clone().unwrap_or_default(),
                            spec.template.spec.as_ref(),
                            Some(&spec.selector),
                        )
                    })
                    .collect())
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::all(self.client.clone());
                Ok(self
                    .list_paged(api)
                    .await?
                    .iter()
                    .filter_map(|s| {
                        let spec = s.spec.as_ref()?;
                        raw_workload(
                            WorkloadKind::StatefulSet,
                            s.metadata.name.as_deref()?,
                            s.metadata.namespace.as_deref()?,
                            s.metadata.labels.clone().unwrap_or_default(),
                            spec.template.spec.as_ref(),
                            Some(&spec.selector),
                        )
                    })
                    .collect())
            }
            WorkloadKind::DaemonSet => {
                let api: Api<DaemonSet> = Api::all(self.client.clone());
                Ok(self
                    .list_paged(api)
                    .await?
                    .iter()
                    .filter_map(|d| {
                        let spec = d.spec.as_ref()?;
                        raw_workload(
                            WorkloadKind::DaemonSet,
                            d.metadata.name.as_deref()?,
                            d.metadata.namespace.as_deref()?,
                            d.metadata.labels.clone().unwrap_or_default(),
                            spec.template.spec.as_ref(),
                            Some(&spec.selector),
                        )
                    })
                    .collect())
            }
            WorkloadKind::CronJob => {
                let api: Api<CronJob> = Api::all(self.client.clone());
                Ok(self
                    .list_paged(api)
                    .await?
                    .iter()
                    .filter_map(|c| {
                        let spec = c.spec.as_ref()?;
                        let job_spec = spec.job_template.spec.as_ref()?;
                        raw_workload(
                            WorkloadKind::CronJob,
                            c.metadata.name.as_deref()?,
                            c.metadata.namespace.as_deref()?,
                            c.metadata.labels.clone().unwrap_or_default(),
                            job_spec.template.spec.as_ref(),
                            job_spec.selector.as_ref(),
                        )
                    })
                    .collect())
            }
            WorkloadKind::Job => self.collect_jobs().await,
            WorkloadKind::Rollout => {
                let objects = self.list_dynamic("argoproj.io", "v1alpha1", "Rollout").await?;
                Ok(objects
                    .iter()
                    .filter_map(|o| dynamic_workload(WorkloadKind::Rollout, o))
                    .collect())
            }
            WorkloadKind::DeploymentConfig => {
                let objects = self
                    .list_dynamic("apps.openshift.io", "v1", "DeploymentConfig")
                    .await?;
                Ok(objects
                    .iter()
                    .filter_map(|o| dynamic_workload(WorkloadKind::DeploymentConfig, o))
                    .collect())
            }
            WorkloadKind::StrimziPodSet => {
                let objects = self
                    .list_dynamic("core.strimzi.io", "v1beta2", "StrimziPodSet")
                    .await?;
                Ok(objects
                    .iter()
                    .filter_map(|o| dynamic_workload(WorkloadKind::StrimziPodSet, o))
                    .collect())
            }
            WorkloadKind::GroupedJob => Ok(Vec::new()),
        }
    }

    async fn collect_jobs(&self) -> Result<Vec<RawWorkload>> {
        let api: Api<Job> = Api::all(self.client.clone());
        let jobs = self.list_paged(api).await?;

        let standalone: Vec<RawWorkload> = jobs
            .iter()
            .filter(|j| !owned_by_cronjob(j))
            .filter_map(|j| {
                let spec = j.spec.as_ref()?;
                raw_workload(
                    WorkloadKind::Job,
                    j.metadata.name.as_deref()?,
                    j.metadata.namespace.as_deref()?,
                    j.metadata.labels.clone().unwrap_or_default(),
                    spec.template.spec.as_ref(),
                    spec.selector.as_ref(),
                )
            })
            .collect();

        Ok(group_jobs(
            standalone,
            &self.config.job_grouping_labels,
            self.config.job_grouping_limit,
        ))
    }

    /// Resolve a workload's pods, Prometheus first so recently deleted
    /// pods within the history window are included.
    async fn resolve_pods(&self, raw: &RawWorkload) -> Result<(Vec<PodRef>, Option<ScanWarning>)> {
        if let Some(metrics) = &self.metrics {
            if metrics.dialect().has_state_metrics() {
                match self.pods_from_metrics(metrics, raw).await {
                    Ok(Some(pods)) if !pods.is_empty() => return Ok((pods, None)),
                    Ok(_) => {}
                    Err(err) if err.is_cluster_fatal() => return Err(err),
                    Err(err) => {
                        debug!(workload = %raw.name, error = %err, "metrics-backed pod lookup failed");
                    }
                }
            } else {
                debug!(
                    workload = %raw.name,
                    "backend has no kube-state-metrics, historical replicas unavailable"
                );
            }
        }

        let pods = self.live_pods(raw).await?;
        Ok((pods, Some(ScanWarning::NoHistoricPods)))
    }

    async fn pods_from_metrics(
        &self,
        metrics: &MetricService,
        raw: &RawWorkload,
    ) -> Result<Option<Vec<PodRef>>> {
        let batch = self.config.owner_batch_size;
        let owner_names = if raw.needs_subowner_lookup {
            match owners::lookup_subowners(
                metrics,
                raw.pod_owner_kind,
                raw.kind.as_str(),
                &raw.pod_owner_names,
                &raw.namespace,
                batch,
            )
            .await?
            {
                Some(names) if !names.is_empty() => names,
                _ => return Ok(Some(Vec::new())),
            }
        } else {
            raw.pod_owner_names.clone()
        };

        owners::lookup_pods(metrics, raw.pod_owner_kind, &owner_names, &raw.namespace, batch).await
    }

    async fn live_pods(&self, raw: &RawWorkload) -> Result<Vec<PodRef>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &raw.namespace);

        // grouped jobs have no single selector; list per member job
        if raw.kind == WorkloadKind::GroupedJob {
            let mut pods = Vec::new();
            for member in &raw.pod_owner_names {
                let params = ListParams::default().labels(&format!("job-name={member}"));
                let list = api.list(&params).await?;
                pods.extend(
                    list.items
                        .into_iter()
                        .filter_map(|p| p.metadata.name)
                        .map(PodRef::alive),
                );
            }
            return Ok(pods);
        }

        let Some(selector) = &raw.selector else {
            return Ok(Vec::new());
        };
        let params = ListParams::default().labels(selector);
        let list = api.list(&params).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .map(PodRef::alive)
            .collect())
    }
}

#[async_trait]
impl WorkloadSource for KubeDiscoverer {
    async fn discover(&self, tx: mpsc::Sender<Workload>) -> Result<()> {
        info!(cluster = %self.cluster, "listing workloads");
        let hpa_index = self.list_hpas().await?;

        let mut raws = Vec::new();
        for kind in self.filter.kinds_to_scan() {
            match self.collect_kind(kind).await {
                Ok(mut list) => raws.append(&mut list),
                Err(err) if err.is_cluster_fatal() => return Err(err),
                Err(err) => {
                    warn!(cluster = %self.cluster, kind = %kind, error = %err, "listing failed, skipping kind");
                }
            }
        }

        raws.retain(|raw| self.filter.matches_namespace(&raw.namespace));
        raws.sort_by(|a, b| {
            (&a.namespace, a.kind, &a.name).cmp(&(&b.namespace, b.kind, &b.name))
        });

        let namespaces: HashSet<_> = raws.iter().map(|r| r.namespace.clone()).collect();
        info!(
            cluster = %self.cluster,
            workloads = raws.len(),
            namespaces = namespaces.len(),
            "workloads listed"
        );

        let mut seen = HashSet::new();
        for raw in raws {
            if !seen.insert((raw.namespace.clone(), raw.kind, raw.name.clone())) {
                continue;
            }
            if raw.containers.is_empty() {
                continue;
            }

            let (pods, pod_warning) = match self.resolve_pods(&raw).await {
                Ok(resolved) => resolved,
                Err(err) if err.is_cluster_fatal() => return Err(err),
                Err(err) => {
                    warn!(workload = %raw.name, error = %err, "pod resolution failed");
                    (Vec::new(), None)
                }
            };

            let mut workload = Workload {
                cluster: self.cluster.clone(),
                namespace: raw.namespace,
                kind: raw.kind,
                name: raw.name,
                containers: raw.containers,
                pods,
                hpa: None,
                warnings: Default::default(),
                labels: raw.labels,
            };

            if let Some(warning) = pod_warning {
                workload.add_warning(warning);
            }
            if workload.pods.is_empty() {
                workload.add_warning(ScanWarning::NoPods);
            }

            let hpa_key = (
                workload.kind.as_str().to_string(),
                workload.name.clone(),
                workload.namespace.clone(),
            );
            if let Some(hpa) = hpa_index.get(&hpa_key) {
                workload.hpa = Some(hpa.clone());
                if !self.filter.allow_hpa {
                    workload.add_warning(ScanWarning::HpaPresent);
                }
            }

            if tx.send(workload).await.is_err() {
                // receiver dropped: the run was cancelled
                return Ok(());
            }
        }
        Ok(())
    }
}

fn owned_by_cronjob(job: &Job) -> bool {
    job.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| owner.kind == "CronJob")
}

fn raw_workload(
    kind: WorkloadKind,
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
    pod_spec: Option<&PodSpec>,
    selector: Option<&LabelSelector>,
) -> Option<RawWorkload> {
    let containers = pod_spec.map(containers_from_pod_spec).unwrap_or_default();
    let (pod_owner_kind, needs_subowner_lookup) = match kind.subowner_kind() {
        Some(subowner) => (subowner, true),
        None => (kind.as_str(), false),
    };

    Some(RawWorkload {
        kind,
        namespace: namespace.to_string(),
        name: name.to_string(),
        labels,
        containers,
        selector: selector.and_then(selector_string),
        pod_owner_kind,
        pod_owner_names: vec![name.to_string()],
        needs_subowner_lookup,
    })
}

fn containers_from_pod_spec(spec: &PodSpec) -> Vec<ContainerSpec> {
    spec.containers.iter().map(container_spec).collect()
}

fn container_spec(container: &Container) -> ContainerSpec {
    let mut allocations = ResourceAllocations::default();
    if let Some(resources) = &container.resources {
        if let Some(requests) = &resources.requests {
            allocations.cpu_request = requests.get("cpu").and_then(|q| quantity::parse_cpu(&q.0));
            allocations.memory_request = requests
                .get("memory")
                .and_then(|q| quantity::parse_memory(&q.0));
        }
        if let Some(limits) = &resources.limits {
            allocations.cpu_limit = limits.get("cpu").and_then(|q| quantity::parse_cpu(&q.0));
            allocations.memory_limit = limits
                .get("memory")
                .and_then(|q| quantity::parse_memory(&q.0));
        }
    }
    ContainerSpec {
        name: container.name.clone(),
        allocations,
    }
}

/// Render a LabelSelector as the query string the pod list API accepts.
fn selector_string(selector: &LabelSelector) -> Option<String> {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    for expr in selector.match_expressions.iter().flatten() {
        let part = match expr.operator.to_lowercase().as_str() {
            "exists" => expr.key.clone(),
            "doesnotexist" => format!("!{}", expr.key),
            op => {
                let values = expr.values.clone().unwrap_or_default().join(",");
                format!("{} {} ({})", expr.key, op, values)
            }
        };
        parts.push(part);
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// Map a CRD object onto a raw workload by walking its JSON spec.
fn dynamic_workload(kind: WorkloadKind, object: &DynamicObject) -> Option<RawWorkload> {
    let name = object.metadata.name.clone()?;
    let namespace = object.metadata.namespace.clone()?;
    let spec = object.data.get("spec")?;

    let containers = match kind {
        // StrimziPodSet inlines full pod definitions instead of a template
        WorkloadKind::StrimziPodSet => spec
            .get("pods")
            .and_then(|pods| pods.as_array())
            .and_then(|pods| pods.first())
            .and_then(|pod| pod.pointer("/spec/containers"))
            .map(containers_from_json)
            .unwrap_or_default(),
        _ => spec
            .pointer("/template/spec/containers")
            .map(containers_from_json)
            .unwrap_or_default(),
    };

    let selector = selector_from_json(spec.get("selector"));
    let (pod_owner_kind, needs_subowner_lookup) = match kind.subowner_kind() {
        Some(subowner) => (subowner, true),
        None => (kind.as_str(), false),
    };

    Some(RawWorkload {
        kind,
        namespace,
        name: name.clone(),
        labels: object.metadata.labels.clone().unwrap_or_default(),
        containers,
        selector,
        pod_owner_kind,
        pod_owner_names: vec![name],
        needs_subowner_lookup,
    })
}

fn containers_from_json(containers: &serde_json::Value) -> Vec<ContainerSpec> {
    let Some(list) = containers.as_array() else {
        return Vec::new();
    };
    list.iter()
        .filter_map(|c| {
            let name = c.get("name")?.as_str()?.to_string();
            let mut allocations = ResourceAllocations::default();
            if let Some(requests) = c.pointer("/resources/requests") {
                allocations.cpu_request = requests
                    .get("cpu")
                    .and_then(|v| v.as_str())
                    .and_then(quantity::parse_cpu);
                allocations.memory_request = requests
                    .get("memory")
                    .and_then(|v| v.as_str())
                    .and_then(quantity::parse_memory);
            }
            if let Some(limits) = c.pointer("/resources/limits") {
                allocations.cpu_limit = limits
                    .get("cpu")
                    .and_then(|v| v.as_str())
                    .and_then(quantity::parse_cpu);
                allocations.memory_limit = limits
                    .get("memory")
                    .and_then(|v| v.as_str())
                    .and_then(quantity::parse_memory);
            }
            Some(ContainerSpec { name, allocations })
        })
        .collect()
}

/// DeploymentConfig declares its selector as a flat map; the others use
/// the matchLabels form.
fn selector_from_json(selector: Option<&serde_json::Value>) -> Option<String> {
    let selector = selector?;
    let map = selector
        .get("matchLabels")
        .and_then(|m| m.as_object())
        .or_else(|| selector.as_object().filter(|m| !m.contains_key("matchExpressions")))?;

    let parts: Vec<String> = map
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|v| format!("{k}={v}")))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

fn hpa_entry(hpa: &HorizontalPodAutoscaler) -> Option<((String, String, String), HpaSpec)> {
    let spec = hpa.spec.as_ref()?;
    let namespace = hpa.metadata.namespace.clone()?;
    let target = &spec.scale_target_ref;

    let mut cpu = None;
    let mut memory = None;
    for metric in spec.metrics.iter().flatten() {
        if metric.type_ != "Resource" {
            continue;
        }
        let Some(resource) = &metric.resource else {
            continue;
        };
        let utilization = resource.target.average_utilization.map(|v| v as f64);
        match resource.name.as_str() {
            "cpu" => cpu = utilization,
            "memory" => memory = utilization,
            _ => {}
        }
    }

    Some((
        (target.kind.clone(), target.name.clone(), namespace),
        HpaSpec {
            min_replicas: spec.min_replicas,
            max_replicas: spec.max_replicas,
            target_cpu_utilization: cpu,
            target_memory_utilization: memory,
        },
    ))
}

/// Fold Jobs carrying every grouping key into GroupedJob workloads. A Job
/// missing any configured key stays standalone. Groups are capped at
/// `limit` members; the overflow is dropped from the group.
fn group_jobs(
    jobs: Vec<RawWorkload>,
    grouping_labels: &[String],
    limit: usize,
) -> Vec<RawWorkload> {
    if grouping_labels.is_empty() {
        return jobs;
    }

    let mut result = Vec::new();
    let mut groups: BTreeMap<(String, String), Vec<RawWorkload>> = BTreeMap::new();

    for job in jobs {
        let values: Option<Vec<(String, String)>> = grouping_labels
            .iter()
            .map(|key| {
                job.labels
                    .get(key)
                    .map(|value| (key.clone(), value.clone()))
            })
            .collect();

        match values {
            Some(pairs) => {
                let group_name = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(",");
                groups
                    .entry((job.namespace.clone(), group_name))
                    .or_default()
                    .push(job);
            }
            None => result.push(job),
        }
    }

    for ((namespace, group_name), mut members) in groups {
        if members.len() > limit {
            debug!(
                group = %group_name,
                members = members.len(),
                limit,
                "job group exceeds member limit, truncating"
            );
            members.truncate(limit);
        }

        // containers are the union of member containers, by name
        let mut containers: Vec<ContainerSpec> = Vec::new();
        for member in &members {
            for container in &member.containers {
                if !containers.iter().any(|c| c.name == container.name) {
                    containers.push(container.clone());
                }
            }
        }

        let labels = members
            .first()
            .map(|m| m.labels.clone())
            .unwrap_or_default();

        result.push(RawWorkload {
            kind: WorkloadKind::GroupedJob,
            namespace,
            name: group_name,
            labels,
            containers,
            selector: None,
            pod_owner_kind: "Job",
            pod_owner_names: members.iter().map(|m| m.name.clone()).collect(),
            needs_subowner_lookup: false,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_raw(name: &str, labels: &[(&str, &str)]) -> RawWorkload {
        RawWorkload {
            kind: WorkloadKind::Job,
            namespace: "default".into(),
            name: name.into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            containers: vec![ContainerSpec {
                name: "main".into(),
                allocations: ResourceAllocations::default(),
            }],
            selector: None,
            pod_owner_kind: "Job",
            pod_owner_names: vec![name.to_string()],
            needs_subowner_lookup: false,
        }
    }

    #[test]
    fn test_group_jobs_by_label_set() {
        let jobs = vec![
            job_raw("job-1", &[("app", "etl")]),
            job_raw("job-2", &[("app", "etl")]),
            job_raw("job-3", &[("app", "reports")]),
            job_raw("job-4", &[("team", "data")]), // missing the grouping key
        ];

        let grouped = group_jobs(jobs, &["app".to_string()], 10);

        let standalone: Vec<_> = grouped
            .iter()
            .filter(|w| w.kind == WorkloadKind::Job)
            .collect();
        assert_eq!(standalone.len(), 1);
        assert_eq!(standalone[0].name, "job-4");

        let etl = grouped
            .iter()
            .find(|w| w.kind == WorkloadKind::GroupedJob && w.name == "app=etl")
            .unwrap();
        assert_eq!(etl.pod_owner_names, vec!["job-1", "job-2"]);
        assert_eq!(etl.pod_owner_kind, "Job");
    }

    #[test]
    fn test_group_jobs_requires_all_keys() {
        let jobs = vec![
            job_raw("job-1", &[("app", "etl"), ("team", "data")]),
            job_raw("job-2", &[("app", "etl")]),
        ];

        let grouped = group_jobs(jobs, &["app".to_string(), "team".to_string()], 10);

        assert!(grouped
            .iter()
            .any(|w| w.kind == WorkloadKind::GroupedJob && w.name == "app=etl,team=data"));
        assert!(grouped
            .iter()
            .any(|w| w.kind == WorkloadKind::Job && w.name == "job-2"));
    }

    #[test]
    fn test_group_jobs_respects_member_limit() {
        let jobs = (0..5)
            .map(|i| job_raw(&format!("job-{i}"), &[("app", "etl")]))
            .collect();
        let grouped = group_jobs(jobs, &["app".to_string()], 3);

        let group = grouped
            .iter()
            .find(|w| w.kind == WorkloadKind::GroupedJob)
            .unwrap();
        assert_eq!(group.pod_owner_names.len(), 3);
        assert_eq!(group.pod_owner_names, vec!["job-0", "job-1", "job-2"]);
    }

    #[test]
    fn test_group_jobs_disabled_without_labels() {
        let jobs = vec![job_raw("job-1", &[("app", "etl")])];
        let grouped = group_jobs(jobs, &[], 10);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].kind, WorkloadKind::Job);
    }

    #[test]
    fn test_selector_string_from_match_labels() {
        let selector = LabelSelector {
            match_labels: Some(
                [("app".to_string(), "web".to_string())]
                    .into_iter()
                    .collect(),
            ),
            match_expressions: None,
        };
        assert_eq!(selector_string(&selector), Some("app=web".to_string()));
    }

    #[test]
    fn test_selector_string_with_expressions() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
        let selector = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".into(),
                    operator: "Exists".into(),
                    values: None,
                },
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: "In".into(),
                    values: Some(vec!["prod".into(), "staging".into()]),
                },
            ]),
        };
        assert_eq!(
            selector_string(&selector),
            Some("tier,env in (prod,staging)".to_string())
        );
    }

    #[test]
    fn test_selector_string_empty_is_none() {
        let selector = LabelSelector::default();
        assert_eq!(selector_string(&selector), None);
    }

    #[test]
    fn test_containers_from_json() {
        let value = serde_json::json!([
            {
                "name": "main",
                "resources": {
                    "requests": {"cpu": "100m", "memory": "128Mi"},
                    "limits": {"memory": "256Mi"}
                }
            },
            {"name": "sidecar"}
        ]);
        let containers = containers_from_json(&value);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].allocations.cpu_request, Some(0.1));
        assert_eq!(
            containers[0].allocations.memory_limit,
            Some(256.0 * 1024.0 * 1024.0)
        );
        assert_eq!(containers[1].allocations, ResourceAllocations::default());
    }

    #[test]
    fn test_selector_from_json_flat_map() {
        // DeploymentConfig style
        let flat = serde_json::json!({"app": "web", "tier": "frontend"});
        assert_eq!(
            selector_from_json(Some(&flat)),
            Some("app=web,tier=frontend".to_string())
        );

        // matchLabels style
        let nested = serde_json::json!({"matchLabels": {"app": "web"}});
        assert_eq!(selector_from_json(Some(&nested)), Some("app=web".to_string()));

        assert_eq!(selector_from_json(None), None);
    }

    #[test]
    fn test_raw_workload_owner_routing() {
        let raw = raw_workload(
            WorkloadKind::Deployment,
            "web",
            "default",
            BTreeMap::new(),
            None,
            None,
        )
        .unwrap();
        assert!(raw.needs_subowner_lookup);
        assert_eq!(raw.pod_owner_kind, "ReplicaSet");

        let raw = raw_workload(
            WorkloadKind::StatefulSet,
            "db",
            "default",
            BTreeMap::new(),
            None,
            None,
        )
        .unwrap();
        assert!(!raw.needs_subowner_lookup);
        assert_eq!(raw.pod_owner_kind, "StatefulSet");
    }
}
