//! Workload discovery
//!
//! Enumerates eligible workloads and their pods. The Kubernetes API is the
//! source of truth for workload specs; pods are resolved through
//! Prometheus first (so recently deleted pods inside the history window
//! are included) with a live-API fallback.

mod kube_api;
mod owners;

pub use kube_api::KubeDiscoverer;

use crate::error::{Result, ScanError};
use crate::models::{Workload, WorkloadKind};
use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;

/// Filter predicate applied during discovery.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    namespace_patterns: Vec<Regex>,
    kinds: Vec<WorkloadKind>,
    pub selector: Option<String>,
    pub allow_hpa: bool,
}

impl DiscoveryFilter {
    /// `namespaces` are glob patterns (`*` matches any run of characters).
    /// An empty list means every namespace except kube-system.
    pub fn new(
        namespaces: &[String],
        kinds: &[WorkloadKind],
        selector: Option<String>,
        allow_hpa: bool,
    ) -> Result<Self> {
        let namespace_patterns = namespaces
            .iter()
            .map(|pattern| {
                let anchored = format!("^{}$", glob_to_regex(pattern));
                Regex::new(&anchored)
                    .map_err(|e| ScanError::Backend(format!("bad namespace pattern {pattern:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            namespace_patterns,
            kinds: kinds.to_vec(),
            selector,
            allow_hpa,
        })
    }

    pub fn matches_namespace(&self, namespace: &str) -> bool {
        if self.namespace_patterns.is_empty() {
            return namespace != "kube-system";
        }
        self.namespace_patterns.iter().any(|re| re.is_match(namespace))
    }

    pub fn matches_kind(&self, kind: WorkloadKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    /// The concrete kinds a discoverer should list. GroupedJob never
    /// appears here: it is synthesized from Jobs.
    pub fn kinds_to_scan(&self) -> Vec<WorkloadKind> {
        let all = [
            WorkloadKind::Deployment,
            WorkloadKind::StatefulSet,
            WorkloadKind::DaemonSet,
            WorkloadKind::Job,
            WorkloadKind::CronJob,
            WorkloadKind::Rollout,
            WorkloadKind::DeploymentConfig,
            WorkloadKind::StrimziPodSet,
        ];
        all.into_iter().filter(|k| self.matches_kind(*k)).collect()
    }
}

fn glob_to_regex(pattern: &str) -> String {
    pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*")
}

/// A finite, non-restartable stream of workloads. Implementations send
/// every discovered workload exactly once, then return.
#[async_trait]
pub trait WorkloadSource: Send + Sync {
    async fn discover(&self, tx: mpsc::Sender<Workload>) -> Result<()>;
}
