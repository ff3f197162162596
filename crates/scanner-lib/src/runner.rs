//! The scan runner
//!
//! Orchestrates discovery, metric acquisition and strategy evaluation
//! under bounded concurrency. Per cluster: a discovery task feeds a
//! channel of workloads, container slots fan out into a worker pool
//! capped at `max_workers`, and finished rows flow into an append-only
//! result set. A slot failure becomes an undefined row; an authorization
//! failure aborts only its cluster; the run as a whole fails when every
//! cluster failed or the shutdown signal fired.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::models::{
    ClusterFailure, ContainerSpec, MetricBundle, Recommendation, RecommendedAllocations,
    ResourceType, RowState, ScanReport, ScanResult, Workload,
};
use crate::observability::{ScanLogger, ScanMetrics};
use crate::prometheus::MetricService;
use crate::query::SlotSelector;
use crate::strategy::{Proposal, RunResult, Strategy, StrategyContext};
use crate::discovery::WorkloadSource;

const MIB: u64 = 1024 * 1024;

/// Everything the runner needs to scan one cluster.
pub struct ClusterHandle {
    pub name: String,
    pub source: Arc<dyn WorkloadSource>,
    pub metrics: Arc<MetricService>,
}

/// The end-to-end scan pipeline.
pub struct ScanRunner {
    config: Arc<ScanConfig>,
    strategy: Arc<dyn Strategy>,
    clusters: Vec<ClusterHandle>,
    metrics: ScanMetrics,
    logger: ScanLogger,
}

impl ScanRunner {
    pub fn new(
        config: Arc<ScanConfig>,
        strategy: Arc<dyn Strategy>,
        clusters: Vec<ClusterHandle>,
    ) -> Self {
        let logger = ScanLogger::new(strategy.name());
        Self {
            config,
            strategy,
            clusters,
            metrics: ScanMetrics::new(),
            logger,
        }
    }

    /// Run the scan. Returns the report unless the run was cancelled or
    /// no cluster could be scanned at all.
    pub async fn run(&self, shutdown: &broadcast::Sender<()>) -> Result<ScanReport> {
        self.logger.log_scan_started(self.clusters.len());

        let scans = self
            .clusters
            .iter()
            .map(|cluster| self.scan_cluster(cluster, shutdown.subscribe()));
        let outcomes = join_all(scans).await;

        let mut report = ScanReport {
            strategy: self.strategy.name().to_string(),
            results: Vec::new(),
            cluster_failures: Vec::new(),
            scanned_clusters: 0,
        };
        let mut cancelled = false;

        for (cluster, outcome) in self.clusters.iter().zip(outcomes) {
            report.results.extend(outcome.results);
            cancelled |= outcome.cancelled;
            match outcome.failure {
                Some(error) => {
                    self.metrics.inc_clusters_failed();
                    self.logger.log_cluster_failed(&cluster.name, &error);
                    report.cluster_failures.push(ClusterFailure {
                        cluster: cluster.name.clone(),
                        error,
                    });
                }
                None => report.scanned_clusters += 1,
            }
        }

        if cancelled {
            return Err(ScanError::Cancelled);
        }
        if !self.clusters.is_empty() && report.scanned_clusters == 0 {
            return Err(ScanError::Backend(
                "no cluster could be scanned successfully".into(),
            ));
        }

        self.logger
            .log_scan_finished(report.results.len(), report.cluster_failures.len());
        Ok(report)
    }

    async fn scan_cluster(
        &self,
        cluster: &ClusterHandle,
        mut shutdown: broadcast::Receiver<()>,
    ) -> ClusterOutcome {
        let (tx, mut rx) = mpsc::channel::<Workload>(self.config.max_workers * 2);
        let source = cluster.source.clone();
        let discovery = tokio::spawn(async move { source.discover(tx).await });

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers: JoinSet<Result<ScanResult>> = JoinSet::new();
        let mut outcome = ClusterOutcome::default();

        'pump: loop {
            tokio::select! {
                maybe_workload = rx.recv() => {
                    let Some(workload) = maybe_workload else {
                        break 'pump;
                    };
                    self.metrics.add_workloads_discovered(1);
                    let workload = Arc::new(workload);
                    for container in workload.containers.clone() {
                        let permit = tokio::select! {
                            permit = semaphore.clone().acquire_owned() => {
                                match permit {
                                    Ok(permit) => permit,
                                    Err(_) => break 'pump,
                                }
                            }
                            _ = shutdown.recv() => {
                                outcome.cancelled = true;
                                break 'pump;
                            }
                        };

                        let config = self.config.clone();
                        let strategy = self.strategy.clone();
                        let metrics = cluster.metrics.clone();
                        let workload = workload.clone();
                        workers.spawn(async move {
                            let _permit = permit;
                            scan_slot(config, strategy, metrics, workload, container).await
                        });
                    }
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    self.collect_worker(finished, &mut outcome);
                }
                _ = shutdown.recv() => {
                    outcome.cancelled = true;
                    break 'pump;
                }
            }
        }

        // cancellation or owner exit: stop feeding, drain in-flight work
        drop(rx);
        while let Some(finished) = workers.join_next().await {
            self.collect_worker(finished, &mut outcome);
        }

        match discovery.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => outcome.failure = Some(err.to_string()),
            Err(join_err) => outcome.failure = Some(join_err.to_string()),
        }

        for row in &outcome.results {
            self.logger.log_recommendation(
                &row.cluster,
                &row.namespace,
                row.kind.as_str(),
                &row.name,
                &row.container,
                &row.state.to_string(),
            );
        }

        outcome
    }

    fn collect_worker(
        &self,
        finished: std::result::Result<Result<ScanResult>, tokio::task::JoinError>,
        outcome: &mut ClusterOutcome,
    ) {
        match finished {
            Ok(Ok(row)) => {
                self.metrics.inc_slots_scanned();
                if row.state == RowState::Undefined {
                    self.metrics.inc_slot_errors();
                }
                outcome.results.push(row);
            }
            Ok(Err(ScanError::Cancelled)) => outcome.cancelled = true,
            Ok(Err(err)) => {
                // cluster-fatal (authorization) failures abort the cluster
                outcome.failure = Some(err.to_string());
            }
            Err(join_err) => {
                warn!(error = %join_err, "scan worker panicked");
                outcome.failure = Some(join_err.to_string());
            }
        }
    }
}

#[derive(Default)]
struct ClusterOutcome {
    results: Vec<ScanResult>,
    failure: Option<String>,
    cancelled: bool,
}

/// Scan one container slot: fetch the strategy's metric kinds in
/// parallel, evaluate the strategy, round to the output boundary.
async fn scan_slot(
    config: Arc<ScanConfig>,
    strategy: Arc<dyn Strategy>,
    metrics: Arc<MetricService>,
    workload: Arc<Workload>,
    container: ContainerSpec,
) -> Result<ScanResult> {
    let pod_names = workload.pod_names();

    // a workload with no known pods is reported but never recommended
    if pod_names.is_empty() {
        let run = RunResult {
            cpu: crate::strategy::ResourceProposal::undefined("no pods discovered"),
            memory: crate::strategy::ResourceProposal::undefined("no pods discovered"),
        };
        return Ok(finalize_row(&config, &workload, &container, MetricBundle::new(), run));
    }

    let slot = SlotSelector {
        namespace: &workload.namespace,
        pods: &pod_names,
        container: &container.name,
    };

    let queries = strategy.required_metrics();
    let fetches = join_all(
        queries
            .iter()
            .map(|query| metrics.gather(query.kind, &slot, query.percentile)),
    )
    .await;

    let mut bundle = MetricBundle::new();
    for (query, fetched) in queries.iter().zip(fetches) {
        let fetch = fetched?;
        if let Some(warning) = fetch.warning {
            bundle.add_warning(warning);
        }
        bundle.insert(query.kind, fetch.series);
    }

    let ctx = StrategyContext {
        workload: workload.clone(),
        container: container.name.clone(),
        current: container.allocations,
        cpu_min_cores: config.cpu_min_cores(),
        memory_min_bytes: config.memory_min_bytes(),
        history_hours: config.history_duration_hours,
    };

    let run = match strategy.recommend(&bundle, &ctx).await {
        Ok(run) => run,
        Err(ScanError::Cancelled) => return Err(ScanError::Cancelled),
        Err(err) => {
            warn!(workload = %workload, container = %container.name, error = %err, "strategy failed");
            RunResult {
                cpu: crate::strategy::ResourceProposal::undefined(format!("strategy failed: {err}")),
                memory: crate::strategy::ResourceProposal::undefined(format!("strategy failed: {err}")),
            }
        }
    };

    debug!(
        workload = %workload,
        container = %container.name,
        "slot scanned"
    );
    Ok(finalize_row(&config, &workload, &container, bundle, run))
}

/// Convert strategy proposals into the final integer-valued row, applying
/// the rounding and minimum clamping policy.
fn finalize_row(
    config: &ScanConfig,
    workload: &Workload,
    container: &ContainerSpec,
    bundle: MetricBundle,
    run: RunResult,
) -> ScanResult {
    let mut clamped = false;

    let cpu_request = round_cpu(run.cpu.request, config.cpu_min_millicores, &mut clamped);
    let cpu_limit = round_cpu(run.cpu.limit, config.cpu_min_millicores, &mut clamped);
    let memory_request = round_memory(run.memory.request, config.memory_min_mib, &mut clamped);
    let memory_limit = round_memory(run.memory.limit, config.memory_min_mib, &mut clamped);

    let hpa_blocked = workload.hpa.as_ref().is_some_and(|hpa| {
        !config.allow_hpa
            && ((hpa.targets(ResourceType::Cpu) && run.cpu.request.is_undefined())
                || (hpa.targets(ResourceType::Memory) && run.memory.request.is_undefined()))
    });

    let state = if hpa_blocked {
        RowState::Ineligible
    } else if cpu_request.is_undefined() || memory_request.is_undefined() {
        RowState::Undefined
    } else if clamped {
        RowState::Clamped
    } else {
        RowState::Ok
    };

    let mut info = BTreeMap::new();
    if let Some(text) = run.cpu.info {
        info.insert(ResourceType::Cpu, text);
    }
    if let Some(text) = run.memory.info {
        info.insert(ResourceType::Memory, text);
    }

    let mut warnings = workload.warnings.clone();
    warnings.extend(bundle.warnings());

    ScanResult {
        cluster: workload.cluster.clone(),
        namespace: workload.namespace.clone(),
        kind: workload.kind,
        name: workload.name.clone(),
        container: container.name.clone(),
        current: container.allocations,
        recommended: RecommendedAllocations {
            cpu_request_millicores: cpu_request,
            cpu_limit_millicores: cpu_limit,
            memory_request_bytes: memory_request,
            memory_limit_bytes: memory_limit,
        },
        state,
        info,
        warnings,
        pods_total: workload.pods.len(),
        pods_active: workload.active_pod_count(),
    }
}

/// Ceiling that forgives floating-point noise just below a whole number,
/// so 0.185 cores stays 185 millicores instead of drifting to 186.
fn ceil_units(raw: f64) -> u64 {
    if (raw - raw.round()).abs() < 1e-6 {
        raw.round() as u64
    } else {
        raw.ceil() as u64
    }
}

/// Cores round up to the next whole millicore, then clamp to the minimum.
fn round_cpu(proposal: Proposal, min_millicores: u64, clamped: &mut bool) -> Recommendation {
    match proposal {
        Proposal::Value(cores) if cores.is_finite() && cores >= 0.0 => {
            let millicores = ceil_units(cores * 1000.0);
            if millicores < min_millicores {
                *clamped = true;
                Recommendation::Value(min_millicores)
            } else {
                Recommendation::Value(millicores)
            }
        }
        Proposal::Value(_) => Recommendation::Undefined,
        Proposal::Unset => Recommendation::Unset,
        Proposal::Undefined => Recommendation::Undefined,
    }
}

/// Bytes round up to the next whole MiB, then clamp to the minimum.
fn round_memory(proposal: Proposal, min_mib: u64, clamped: &mut bool) -> Recommendation {
    match proposal {
        Proposal::Value(bytes) if bytes.is_finite() && bytes >= 0.0 => {
            let mib = ceil_units(bytes / MIB as f64);
            if mib < min_mib {
                *clamped = true;
                Recommendation::Value(min_mib * MIB)
            } else {
                Recommendation::Value(mib * MIB)
            }
        }
        Proposal::Value(_) => Recommendation::Undefined,
        Proposal::Unset => Recommendation::Unset,
        Proposal::Undefined => Recommendation::Undefined,
    }
}
