//! Core data models for the scan pipeline

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Controller kinds eligible for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
    Job,
    CronJob,
    Rollout,
    DeploymentConfig,
    StrimziPodSet,
    /// Synthetic workload formed by grouping Jobs that share a configured
    /// label key set.
    GroupedJob,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::Job => "Job",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::Rollout => "Rollout",
            WorkloadKind::DeploymentConfig => "DeploymentConfig",
            WorkloadKind::StrimziPodSet => "StrimziPodSet",
            WorkloadKind::GroupedJob => "GroupedJob",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let all = [
            WorkloadKind::Deployment,
            WorkloadKind::StatefulSet,
            WorkloadKind::DaemonSet,
            WorkloadKind::Job,
            WorkloadKind::CronJob,
            WorkloadKind::Rollout,
            WorkloadKind::DeploymentConfig,
            WorkloadKind::StrimziPodSet,
            WorkloadKind::GroupedJob,
        ];
        all.into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
    }

    /// The intermediate owner kind sitting between this controller and its
    /// pods, if any. Pods of a Deployment are owned by a ReplicaSet, not by
    /// the Deployment itself.
    pub fn subowner_kind(&self) -> Option<&'static str> {
        match self {
            WorkloadKind::Deployment | WorkloadKind::Rollout => Some("ReplicaSet"),
            WorkloadKind::DeploymentConfig => Some("ReplicationController"),
            WorkloadKind::CronJob => Some("Job"),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pod known to belong to a workload. `deleted` marks pods that no longer
/// exist in the cluster but still have samples within the history window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
    pub name: String,
    pub deleted: bool,
}

impl PodRef {
    pub fn alive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deleted: false,
        }
    }

    pub fn deleted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deleted: true,
        }
    }
}

/// HorizontalPodAutoscaler descriptor attached to a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpaSpec {
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    pub target_cpu_utilization: Option<f64>,
    pub target_memory_utilization: Option<f64>,
}

impl HpaSpec {
    pub fn targets(&self, resource: ResourceType) -> bool {
        match resource {
            ResourceType::Cpu => self.target_cpu_utilization.is_some(),
            ResourceType::Memory => self.target_memory_utilization.is_some(),
        }
    }
}

/// The two resources a recommendation covers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => f.write_str("cpu"),
            ResourceType::Memory => f.write_str("memory"),
        }
    }
}

/// Currently declared requests and limits of one container.
///
/// CPU values are cores, memory values are bytes. `None` means the field is
/// not declared in the container spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocations {
    pub cpu_request: Option<f64>,
    pub cpu_limit: Option<f64>,
    pub memory_request: Option<f64>,
    pub memory_limit: Option<f64>,
}

/// A container slot of a workload: name plus its declared allocations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub allocations: ResourceAllocations,
}

/// Warnings accumulated while discovering or scanning a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanWarning {
    /// No pods could be found, neither live nor historical.
    NoPods,
    /// Pods came from the live API only; recently deleted pods are missing.
    NoHistoricPods,
    /// The workload is targeted by an HPA and `allow_hpa` is off.
    HpaPresent,
    /// The OOM signal was inferred from restarts, not observed directly.
    OomSignalInferred,
    /// A metric kind could not be fetched and was treated as empty.
    MetricUnavailable,
}

impl ScanWarning {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanWarning::NoPods => "no-pods",
            ScanWarning::NoHistoricPods => "no-historic-pods",
            ScanWarning::HpaPresent => "hpa-present",
            ScanWarning::OomSignalInferred => "oom-signal-inferred",
            ScanWarning::MetricUnavailable => "metric-unavailable",
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One eligible workload, fully assembled by discovery and read-only after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub cluster: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub containers: Vec<ContainerSpec>,
    pub pods: Vec<PodRef>,
    pub hpa: Option<HpaSpec>,
    pub warnings: BTreeSet<ScanWarning>,
    pub labels: BTreeMap<String, String>,
}

impl Workload {
    pub fn ident(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.cluster, self.namespace, self.kind, self.name
        )
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.iter().map(|p| p.name.clone()).collect()
    }

    pub fn active_pod_count(&self) -> usize {
        self.pods.iter().filter(|p| !p.deleted).count()
    }

    pub fn add_warning(&mut self, warning: ScanWarning) {
        self.warnings.insert(warning);
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Metric kinds the query builder knows how to express.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    /// Per-pod CPU usage rate over the window, one sample per step.
    CpuUsage,
    /// Per-pod percentile of the CPU usage rate, one scalar per pod.
    CpuPercentile,
    /// Per-pod count of CPU samples within the window.
    CpuPoints,
    /// Per-pod working-set bytes, one sample per step.
    Memory,
    /// Per-pod maximum working-set bytes over the window.
    MaxMemory,
    /// Per-pod count of memory samples within the window.
    MemoryPoints,
    /// Per-pod memory limit at the most recent OOM kill, 0 if none.
    OomKilledMemory,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::CpuUsage => "cpu-usage",
            MetricKind::CpuPercentile => "cpu-percentile",
            MetricKind::CpuPoints => "cpu-points",
            MetricKind::Memory => "memory",
            MetricKind::MaxMemory => "max-memory",
            MetricKind::MemoryPoints => "memory-points",
            MetricKind::OomKilledMemory => "oom-killed-memory",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Samples for one metric kind, keyed by pod name. BTreeMap keeps the
/// iteration order stable so repeated runs stay byte-identical.
pub type PodSeries = BTreeMap<String, Vec<Sample>>;

/// All metric series fetched for one container slot.
#[derive(Debug, Clone, Default)]
pub struct MetricBundle {
    series: BTreeMap<MetricKind, PodSeries>,
    warnings: BTreeSet<ScanWarning>,
}

impl MetricBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: MetricKind, series: PodSeries) {
        self.series.insert(kind, series);
    }

    pub fn add_warning(&mut self, warning: ScanWarning) {
        self.warnings.insert(warning);
    }

    pub fn get(&self, kind: MetricKind) -> Option<&PodSeries> {
        self.series.get(&kind)
    }

    pub fn warnings(&self) -> impl Iterator<Item = ScanWarning> + '_ {
        self.warnings.iter().copied()
    }

    /// Sum of per-pod point counts for a `*Points` kind. Those queries
    /// return a single sample per pod whose value is the count.
    pub fn total_points(&self, kind: MetricKind) -> f64 {
        self.series
            .get(&kind)
            .map(|pods| {
                pods.values()
                    .filter_map(|samples| samples.first())
                    .map(|s| s.value)
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Maximum sample value across all pods of a kind, if any samples exist.
    pub fn max_over_pods(&self, kind: MetricKind) -> Option<f64> {
        self.series.get(&kind).and_then(|pods| {
            pods.values()
                .flat_map(|samples| samples.iter().map(|s| s.value))
                .fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.max(v)))
                })
        })
    }

    /// All sample values of a kind pooled across pods, in pod order.
    pub fn pooled_values(&self, kind: MetricKind) -> Vec<f64> {
        self.series
            .get(&kind)
            .map(|pods| {
                pods.values()
                    .flat_map(|samples| samples.iter().map(|s| s.value))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self, kind: MetricKind) -> bool {
        self.series.get(&kind).map_or(true, |pods| pods.is_empty())
    }
}

/// A recommended value at the output boundary: integer millicores for CPU,
/// integer bytes for memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "value")]
pub enum Recommendation {
    /// A concrete recommendation.
    Value(u64),
    /// The strategy decided the field should not be set at all.
    Unset,
    /// The strategy could not produce a recommendation.
    Undefined,
}

impl Recommendation {
    pub fn value(&self) -> Option<u64> {
        match self {
            Recommendation::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Recommendation::Undefined)
    }
}

/// Recommended allocations for one container slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedAllocations {
    pub cpu_request_millicores: Recommendation,
    pub cpu_limit_millicores: Recommendation,
    pub memory_request_bytes: Recommendation,
    pub memory_limit_bytes: Recommendation,
}

impl RecommendedAllocations {
    pub fn undefined() -> Self {
        Self {
            cpu_request_millicores: Recommendation::Undefined,
            cpu_limit_millicores: Recommendation::Undefined,
            memory_request_bytes: Recommendation::Undefined,
            memory_limit_bytes: Recommendation::Undefined,
        }
    }
}

/// Aggregate state of one report row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowState {
    Ok,
    /// At least one value was raised to the configured minimum.
    Clamped,
    /// At least one request could not be computed.
    Undefined,
    /// The workload is HPA-managed and recommendations were withheld.
    Ineligible,
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowState::Ok => f.write_str("ok"),
            RowState::Clamped => f.write_str("clamped"),
            RowState::Undefined => f.write_str("undefined"),
            RowState::Ineligible => f.write_str("ineligible"),
        }
    }
}

/// How far a recommendation sits from the current allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Ok,
    Good,
    Unknown,
}

impl Severity {
    /// CPU is graded on the absolute difference in cores. Both sides
    /// missing is fine; exactly one side missing warrants a look.
    pub fn for_cpu(current_cores: Option<f64>, recommended_millicores: Option<u64>) -> Self {
        let (current, recommended) = match (current_cores, recommended_millicores) {
            (Some(c), Some(r)) => (c, r as f64 / 1000.0),
            (None, None) => return Severity::Good,
            _ => return Severity::Warning,
        };
        let diff = (current - recommended).abs();
        if diff >= 0.5 {
            Severity::Critical
        } else if diff >= 0.25 {
            Severity::Warning
        } else if diff >= 0.1 {
            Severity::Ok
        } else {
            Severity::Good
        }
    }

    /// Memory is graded on the absolute difference in MiB.
    pub fn for_memory(current_bytes: Option<f64>, recommended_bytes: Option<u64>) -> Self {
        let (current, recommended) = match (current_bytes, recommended_bytes) {
            (Some(c), Some(r)) => (c, r as f64),
            (None, None) => return Severity::Good,
            _ => return Severity::Warning,
        };
        let diff_mib = (current - recommended).abs() / (1024.0 * 1024.0);
        if diff_mib >= 500.0 {
            Severity::Critical
        } else if diff_mib >= 250.0 {
            Severity::Warning
        } else if diff_mib >= 100.0 {
            Severity::Ok
        } else {
            Severity::Good
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Critical => f.write_str("critical"),
            Severity::Warning => f.write_str("warning"),
            Severity::Ok => f.write_str("ok"),
            Severity::Good => f.write_str("good"),
            Severity::Unknown => f.write_str("unknown"),
        }
    }
}

/// One row of the final report: a container slot with its recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub cluster: String,
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
    pub container: String,
    pub current: ResourceAllocations,
    pub recommended: RecommendedAllocations,
    pub state: RowState,
    /// Free-form explanation keyed by resource.
    pub info: BTreeMap<ResourceType, String>,
    pub warnings: BTreeSet<ScanWarning>,
    pub pods_total: usize,
    pub pods_active: usize,
}

impl ScanResult {
    /// Stable identity of the slot this row describes.
    pub fn slot_key(&self) -> (String, String, WorkloadKind, String, String) {
        (
            self.cluster.clone(),
            self.namespace.clone(),
            self.kind,
            self.name.clone(),
            self.container.clone(),
        )
    }
}

/// A cluster that could not be scanned at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterFailure {
    pub cluster: String,
    pub error: String,
}

/// The aggregate outcome of one scan run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub strategy: String,
    pub results: Vec<ScanResult>,
    pub cluster_failures: Vec<ClusterFailure>,
    /// Clusters that produced a complete result set.
    pub scanned_clusters: usize,
}

impl ScanReport {
    /// Consumers that need a stable order sort by the full slot identity.
    pub fn sort_results(&mut self) {
        self.results.sort_by(|a, b| a.slot_key().cmp(&b.slot_key()));
    }
}
