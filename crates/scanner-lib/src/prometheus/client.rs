//! HTTP client for the Prometheus query API
//!
//! Covers the three endpoints the scanner needs: `/api/v1/query`,
//! `/api/v1/query_range` and `/api/v1/label/<name>/values`. The caller
//! wires authentication by passing pre-built headers; this client never
//! acquires credentials itself.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{PromQuerier, RawSeries};
use crate::error::{Result, ScanError};

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<RawSeries>,
}

#[derive(Debug, Deserialize)]
struct LabelValuesResponse {
    status: String,
    #[serde(default)]
    data: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Client for one Prometheus-compatible backend.
pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: Url,
}

impl PrometheusClient {
    /// `headers` carries whatever auth the caller configured (bearer
    /// token, custom headers); `timeout` bounds each request.
    pub fn new(
        base_url: Url,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ScanError::Backend(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ScanError::Backend(format!("invalid header value: {e}")))?;
            header_map.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(header_map)
            .build()
            .map_err(|e| ScanError::Backend(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Cheap connectivity probe; surfaces auth and reachability problems
    /// before the scan fans out.
    pub async fn check_connection(&self) -> Result<()> {
        self.query("vector(1)").await.map(|_| ())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        // join() would drop a path suffix like /v1/projects/.../prometheus
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ScanError::Backend("prometheus URL cannot be a base".into()))?;
            segments.pop_if_empty();
            for part in path.split('/') {
                segments.push(part);
            }
        }
        Ok(url)
    }

    async fn get_query(&self, url: Url, params: &[(&str, String)]) -> Result<Vec<RawSeries>> {
        let response = self.http.get(url).query(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::from_status(status, body));
        }

        let parsed: QueryResponse = response.json().await?;
        if parsed.status != "success" {
            return Err(ScanError::Backend(
                parsed.error.unwrap_or_else(|| "query failed".into()),
            ));
        }
        Ok(parsed.data.map(|d| d.result).unwrap_or_default())
    }
}

#[async_trait]
impl PromQuerier for PrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: &str,
    ) -> Result<Vec<RawSeries>> {
        debug!(start = %start, end = %end, step, "range query");
        let url = self.endpoint("api/v1/query_range")?;
        self.get_query(
            url,
            &[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", step.to_string()),
            ],
        )
        .await
    }

    async fn query(&self, query: &str) -> Result<Vec<RawSeries>> {
        debug!(query, "instant query");
        let url = self.endpoint("api/v1/query")?;
        self.get_query(url, &[("query", query.to_string())]).await
    }

    async fn label_values(&self, label: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&format!("api/v1/label/{label}/values"))?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::from_status(status, body));
        }

        let parsed: LabelValuesResponse = response.json().await?;
        if parsed.status != "success" {
            return Err(ScanError::Backend(
                parsed.error.unwrap_or_else(|| "label query failed".into()),
            ));
        }
        Ok(parsed.data)
    }
}
