//! Backend-specific PromQL generation
//!
//! Three dialects are supported: classic Prometheus metric names and
//! syntax, GCP Managed Prometheus (`kubernetes.io/container/*` metrics in
//! UTF-8 braced form), and Anthos (same shape under the
//! `kubernetes.io/anthos/container/*` prefix). GCP and Anthos results are
//! wrapped in `label_replace` so downstream code always sees the standard
//! `pod` and `container` label names.
//!
//! The builder is a pure function of its inputs: no I/O, no state beyond
//! the dialect tag and the optional cluster label.

mod gcp;
mod standard;

use crate::config::DialectOverride;
use crate::error::Result;
use crate::models::MetricKind;
use chrono::Duration;

/// The query dialect of a Prometheus-compatible backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromDialect {
    Standard,
    GcpManaged,
    Anthos,
}

impl PromDialect {
    /// Pick the dialect for a backend URL. Google Managed Prometheus is
    /// served from `monitoring.googleapis.com`; `anthos_requested` switches
    /// that detection to the Anthos metric prefix.
    pub fn detect(url: &url::Url, anthos_requested: bool) -> Self {
        let is_gcp = url
            .host_str()
            .map(|host| host == "monitoring.googleapis.com" || host.ends_with(".monitoring.googleapis.com"))
            .unwrap_or(false);

        match (is_gcp, anthos_requested) {
            (true, true) => PromDialect::Anthos,
            (true, false) => PromDialect::GcpManaged,
            (false, _) => PromDialect::Standard,
        }
    }

    pub fn from_override(value: DialectOverride) -> Self {
        match value {
            DialectOverride::Standard => PromDialect::Standard,
            DialectOverride::Gcp => PromDialect::GcpManaged,
            DialectOverride::Anthos => PromDialect::Anthos,
        }
    }

    /// Whether the backend carries kube-state-metrics series. Pod and
    /// owner discovery queries only exist there.
    pub fn has_state_metrics(&self) -> bool {
        matches!(self, PromDialect::Standard)
    }

    /// Whether the OOM signal is inferred from restarts instead of the
    /// terminated-reason series.
    pub fn infers_oom_signal(&self) -> bool {
        !matches!(self, PromDialect::Standard)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PromDialect::Standard => "standard",
            PromDialect::GcpManaged => "gcp",
            PromDialect::Anthos => "anthos",
        }
    }
}

/// The container slot a metric query targets.
#[derive(Debug, Clone)]
pub struct SlotSelector<'a> {
    pub namespace: &'a str,
    pub pods: &'a [String],
    pub container: &'a str,
}

impl SlotSelector<'_> {
    /// Pod names joined into a regex alternation. An empty pod list
    /// matches everything so a query still parses.
    pub(crate) fn pods_regex(&self) -> String {
        if self.pods.is_empty() {
            ".*".to_string()
        } else {
            self.pods.join("|")
        }
    }
}

/// Produces query strings for the active dialect.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    dialect: PromDialect,
    cluster_label: Option<(String, String)>,
}

impl QueryBuilder {
    pub fn new(dialect: PromDialect, cluster_label: Option<(String, String)>) -> Self {
        Self {
            dialect,
            cluster_label,
        }
    }

    pub fn dialect(&self) -> PromDialect {
        self.dialect
    }

    /// The `, key="value"` fragment appended inside every matcher set, or
    /// an empty string when no cluster label is configured. GCP and Anthos
    /// use the UTF-8 braced form, which quotes label names.
    fn cluster_matcher(&self) -> String {
        match (&self.cluster_label, self.dialect) {
            (None, _) => String::new(),
            (Some((key, value)), PromDialect::Standard) => {
                format!(", {key}=\"{value}\"")
            }
            (Some((key, value)), _) => format!(", \"{key}\"=\"{value}\""),
        }
    }

    /// Build the query for one metric kind. `history` and `step` are
    /// Prometheus duration literals; `percentile` is required for
    /// [`MetricKind::CpuPercentile`].
    pub fn metric_query(
        &self,
        kind: MetricKind,
        slot: &SlotSelector<'_>,
        history: &str,
        step: &str,
        percentile: Option<f64>,
    ) -> Result<String> {
        let cluster = self.cluster_matcher();
        let query = match self.dialect {
            PromDialect::Standard => {
                standard::metric_query(kind, slot, &cluster, history, step, percentile)
            }
            PromDialect::GcpManaged => gcp::metric_query(
                gcp::CONTAINER_PREFIX,
                kind,
                slot,
                &cluster,
                history,
                step,
                percentile,
            ),
            PromDialect::Anthos => gcp::metric_query(
                gcp::ANTHOS_PREFIX,
                kind,
                slot,
                &cluster,
                history,
                step,
                percentile,
            ),
        };
        Ok(query)
    }

    /// Query for the ReplicaSet / ReplicationController / Job names owned
    /// by the given controllers. `None` when the dialect has no
    /// kube-state-metrics equivalent.
    pub fn subowner_names_query(
        &self,
        subowner_kind: &str,
        owner_kind: &str,
        owner_names_regex: &str,
        namespace: &str,
        history: &str,
    ) -> Option<String> {
        if !self.dialect.has_state_metrics() {
            return None;
        }
        Some(standard::subowner_names_query(
            subowner_kind,
            owner_kind,
            owner_names_regex,
            namespace,
            &self.cluster_matcher(),
            history,
        ))
    }

    /// Query for pods owned by the given owners within the history window.
    pub fn pod_owners_query(
        &self,
        owner_kind: &str,
        owner_names_regex: &str,
        namespace: &str,
        history: &str,
    ) -> Option<String> {
        if !self.dialect.has_state_metrics() {
            return None;
        }
        Some(standard::pod_owners_query(
            owner_kind,
            owner_names_regex,
            namespace,
            &self.cluster_matcher(),
            history,
        ))
    }

    /// Query flagging which of the given pods are currently Running.
    pub fn running_pods_query(&self, pods_regex: &str, namespace: &str) -> Option<String> {
        if !self.dialect.has_state_metrics() {
            return None;
        }
        Some(standard::running_pods_query(
            pods_regex,
            namespace,
            &self.cluster_matcher(),
        ))
    }
}

/// Render a duration as a Prometheus literal: whole days when possible,
/// then whole minutes, then seconds.
pub fn duration_literal(duration: Duration) -> String {
    let secs = duration.num_seconds().max(1);
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
