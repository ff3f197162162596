//! Error taxonomy for the scan pipeline
//!
//! Each variant maps to a distinct recovery path: transient errors are
//! retried, backend errors empty out a single metric kind, auth errors
//! abort a whole cluster, and strategy errors produce an undefined row.

use crate::models::MetricKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScanError>;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Network-level failures and HTTP 5xx / 408 / 429. Retried with
    /// backoff before being promoted to `Backend`.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Retries exhausted or the backend returned a semantic failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// HTTP 401/403 from the Kubernetes API or Prometheus. Aborts the
    /// current cluster only.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Fewer samples than `points_required` were available.
    #[error("not enough data: {got} of {required} required points")]
    InsufficientData { got: u64, required: u64 },

    /// The active dialect cannot express this metric kind.
    #[error("metric {0} is not supported by this backend")]
    UnsupportedMetric(MetricKind),

    /// The strategy failed or produced a malformed result.
    #[error("strategy failed: {0}")]
    Strategy(String),

    /// The run-level cancel token fired.
    #[error("scan cancelled")]
    Cancelled,
}

impl ScanError {
    /// Whether the retry loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::Transient(_))
    }

    /// Whether this failure should take the whole cluster out of the run.
    pub fn is_cluster_fatal(&self) -> bool {
        matches!(self, ScanError::Auth(_))
    }

    /// Classify an HTTP status into the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status.as_u16() {
            401 | 403 => ScanError::Auth(format!("{status}: {detail}")),
            408 | 429 => ScanError::Transient(format!("{status}: {detail}")),
            500..=599 => ScanError::Transient(format!("{status}: {detail}")),
            _ => ScanError::Backend(format!("{status}: {detail}")),
        }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ScanError::from_status(status, err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return ScanError::Transient(err.to_string());
        }
        ScanError::Backend(err.to_string())
    }
}

impl From<kube::Error> for ScanError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 401 || response.code == 403 => {
                ScanError::Auth(err.to_string())
            }
            kube::Error::Api(response) if response.code == 408 || response.code == 429 => {
                ScanError::Transient(err.to_string())
            }
            kube::Error::Api(response) if response.code >= 500 => {
                ScanError::Transient(err.to_string())
            }
            _ => ScanError::Backend(err.to_string()),
        }
    }
}
