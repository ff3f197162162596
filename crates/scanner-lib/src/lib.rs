//! Core library for the Kubernetes resource right-sizing scanner
//!
//! This crate provides the scan pipeline:
//! - Dialect-aware PromQL generation (standard, GCP Managed, Anthos)
//! - Metric acquisition with retries, range splitting and rate capping
//! - Workload discovery from the Kubernetes API and kube-state-metrics
//! - Pluggable recommendation strategies
//! - The bounded-concurrency scan runner

pub mod config;
pub mod discovery;
pub mod error;
pub mod models;
pub mod observability;
pub mod prometheus;
pub mod quantity;
pub mod query;
pub mod runner;
pub mod strategy;

pub use config::{
    DialectOverride, ScanConfig, SimpleLimitSettings, SimpleSettings, StrategyCommon,
};
pub use error::{Result, ScanError};
pub use models::*;
pub use observability::{ScanLogger, ScanMetrics};
pub use runner::{ClusterHandle, ScanRunner};
