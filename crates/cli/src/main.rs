//! Kubernetes resource right-sizing scanner CLI
//!
//! Wires the scan pipeline: builds authenticated Kubernetes and
//! Prometheus clients from the flags, selects a strategy, runs the
//! scanner and renders the report.

mod output;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use kube::config::KubeConfigOptions;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use scanner_lib::discovery::{DiscoveryFilter, KubeDiscoverer};
use scanner_lib::prometheus::{MetricService, PromQuerier, PrometheusClient};
use scanner_lib::query::{PromDialect, QueryBuilder};
use scanner_lib::strategy::{
    AiAssistedStrategy, HttpLlmClient, SimpleLimitStrategy, SimpleStrategy, Strategy,
};
use scanner_lib::{
    ClusterHandle, DialectOverride, ScanConfig, ScanError, ScanRunner, SimpleLimitSettings,
    SimpleSettings, StrategyCommon, WorkloadKind,
};

/// Right-size Kubernetes container resources from historical usage
#[derive(Parser)]
#[command(name = "krs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Kubeconfig contexts to scan (repeatable); default is the current context
    #[arg(long = "context")]
    contexts: Vec<String>,

    /// Path to the kubeconfig file
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<String>,

    /// Namespace patterns to scan (repeatable, `*` wildcard); default is
    /// all namespaces except kube-system
    #[arg(long = "namespace", short = 'n')]
    namespaces: Vec<String>,

    /// Workload kinds to scan (repeatable); default is all supported kinds
    #[arg(long = "resource")]
    resources: Vec<String>,

    /// Label selector applied when listing workloads
    #[arg(long)]
    selector: Option<String>,

    /// Prometheus-compatible base URL
    #[arg(long, short = 'p', env = "KRS_PROMETHEUS_URL")]
    prometheus_url: String,

    /// Extra header for Prometheus requests, as "Name: value" (repeatable)
    #[arg(long = "prometheus-header")]
    prometheus_headers: Vec<String>,

    /// Force the query dialect instead of auto-detecting it
    #[arg(long, value_enum)]
    prometheus_dialect: Option<DialectArg>,

    /// Label key isolating this cluster in a shared Prometheus
    #[arg(long)]
    cluster_label_key: Option<String>,

    /// Label value isolating this cluster in a shared Prometheus
    #[arg(long)]
    cluster_label_value: Option<String>,

    /// History window in hours
    #[arg(long, default_value_t = 336.0)]
    history_duration: f64,

    /// Range query step in minutes
    #[arg(long, default_value_t = 1.25)]
    timeframe_duration: f64,

    /// Samples required before recommending a resource
    #[arg(long, default_value_t = 100)]
    points_required: u64,

    /// Concurrent container slots
    #[arg(long, default_value_t = 10)]
    max_workers: usize,

    /// Minimum CPU recommendation in millicores
    #[arg(long = "cpu-min", default_value_t = 10)]
    cpu_min_millicores: u64,

    /// Minimum memory recommendation in MiB
    #[arg(long = "memory-min", default_value_t = 100)]
    memory_min_mib: u64,

    /// Recommend even when an HPA targets the workload
    #[arg(long)]
    allow_hpa: bool,

    /// Use OOM-kill data for memory recommendations
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    use_oomkill_data: bool,

    /// Label keys that group Jobs into one synthetic workload (repeatable)
    #[arg(long = "job-grouping-label")]
    job_grouping_labels: Vec<String>,

    /// Impersonate this user for Kubernetes API calls
    #[arg(long)]
    as_user: Option<String>,

    /// Impersonate these groups for Kubernetes API calls (repeatable)
    #[arg(long)]
    as_group: Vec<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum DialectArg {
    Standard,
    Gcp,
    Anthos,
}

impl From<DialectArg> for DialectOverride {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Standard => DialectOverride::Standard,
            DialectArg::Gcp => DialectOverride::Gcp,
            DialectArg::Anthos => DialectOverride::Anthos,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Percentile CPU request, buffered peak memory, no CPU limit
    Simple {
        /// Percentile for the CPU request
        #[arg(long, default_value_t = 95.0)]
        cpu_percentile: f64,

        /// Buffer added to the peak memory usage, in percent
        #[arg(long, default_value_t = 15.0)]
        memory_buffer_percentage: f64,

        /// Buffer added to the OOM-killed memory limit, in percent
        #[arg(long, default_value_t = 25.0)]
        oom_memory_buffer_percentage: f64,
    },

    /// Like simple, but with a CPU limit from a higher percentile
    SimpleLimit {
        /// Percentile for the CPU request
        #[arg(long, default_value_t = 66.0)]
        cpu_request_percentile: f64,

        /// Percentile for the CPU limit
        #[arg(long, default_value_t = 96.0)]
        cpu_limit_percentile: f64,

        #[arg(long, default_value_t = 15.0)]
        memory_buffer_percentage: f64,

        #[arg(long, default_value_t = 25.0)]
        oom_memory_buffer_percentage: f64,
    },

    /// Ask an LLM endpoint to analyze the usage statistics
    Ai {
        /// LLM endpoint receiving the prompt as a JSON POST
        #[arg(long, env = "KRS_LLM_URL")]
        llm_url: String,

        /// LLM request timeout in seconds
        #[arg(long, default_value_t = 60)]
        llm_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Arc::new(build_config(&cli));
    let strategy = build_strategy(&cli, &config)?;

    let prom_url = url::Url::parse(&cli.prometheus_url)
        .with_context(|| format!("invalid Prometheus URL {:?}", cli.prometheus_url))?;
    let dialect = match cli.prometheus_dialect {
        Some(arg) => PromDialect::from_override(arg.into()),
        None => PromDialect::detect(&prom_url, false),
    };
    info!(dialect = dialect.as_str(), url = %prom_url, "using metrics backend");

    let headers = parse_headers(&cli.prometheus_headers)?;
    let prom_client = Arc::new(
        PrometheusClient::new(
            prom_url,
            &headers,
            Duration::from_secs(config.prom_timeout_secs),
        )
        .map_err(|e| anyhow::anyhow!("{e}"))?,
    );
    if let Err(err) = prom_client.check_connection().await {
        warn!(error = %err, "Prometheus connectivity check failed, continuing anyway");
    }

    // one Prometheus can serve several clusters; refuse to scan without a
    // disambiguating label in that case, and refuse an unknown label value
    let label_key = cli.cluster_label_key.as_deref().unwrap_or("cluster");
    match prom_client.label_values(label_key).await {
        Ok(cluster_names) if cluster_names.len() > 1 => match &cli.cluster_label_value {
            None => {
                return Err(ScanError::Backend(format!(
                    "the backend carries metrics for {} clusters ({}); rerun with \
                     --cluster-label-key and --cluster-label-value set to one of them",
                    cluster_names.len(),
                    cluster_names.join(", ")
                ))
                .into());
            }
            Some(value) if !cluster_names.contains(value) => {
                return Err(ScanError::Backend(format!(
                    "cluster label value {value:?} does not exist; known values: {}",
                    cluster_names.join(", ")
                ))
                .into());
            }
            Some(_) => {}
        },
        // zero or one cluster of metrics: nothing to disambiguate
        Ok(_) => {}
        Err(err) => warn!(error = %err, "could not list cluster label values"),
    }

    let kinds = parse_kinds(&cli.resources)?;
    let filter = DiscoveryFilter::new(&cli.namespaces, &kinds, cli.selector.clone(), cli.allow_hpa)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let contexts: Vec<Option<String>> = if cli.contexts.is_empty() {
        vec![None]
    } else {
        cli.contexts.iter().cloned().map(Some).collect()
    };

    let builder = QueryBuilder::new(dialect, config.cluster_label());
    let mut clusters = Vec::new();
    for context in contexts {
        let name = context.clone().unwrap_or_else(|| "current".to_string());
        let client = kube_client(&cli, context.as_deref())
            .await
            .with_context(|| format!("failed to build Kubernetes client for {name}"))?;

        let metrics = Arc::new(MetricService::new(
            prom_client.clone(),
            builder.clone(),
            &config,
        ));
        let discoverer = KubeDiscoverer::new(
            name.clone(),
            client,
            Some(metrics.clone()),
            filter.clone(),
            config.clone(),
        );

        clusters.push(ClusterHandle {
            name,
            source: Arc::new(discoverer),
            metrics,
        });
    }

    let runner = ScanRunner::new(config, strategy, clusters);

    let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining workers");
            let _ = signal_tx.send(());
        }
    });

    match runner.run(&shutdown_tx).await {
        Ok(mut report) => {
            report.sort_results();
            output::print_report(&report, cli.format)?;
            Ok(())
        }
        Err(ScanError::Cancelled) => {
            output::print_error("scan cancelled");
            std::process::exit(130);
        }
        Err(err) => {
            output::print_error(&err.to_string());
            std::process::exit(1);
        }
    }
}

fn build_config(cli: &Cli) -> ScanConfig {
    let mut config = ScanConfig::default();
    config.history_duration_hours = cli.history_duration;
    config.timeframe_duration_minutes = cli.timeframe_duration;
    config.points_required = cli.points_required;
    config.max_workers = cli.max_workers;
    config.cpu_min_millicores = cli.cpu_min_millicores;
    config.memory_min_mib = cli.memory_min_mib;
    config.allow_hpa = cli.allow_hpa;
    config.use_oomkill_data = cli.use_oomkill_data;
    config.cluster_label_key = cli.cluster_label_key.clone();
    config.cluster_label_value = cli.cluster_label_value.clone();
    config.prometheus_url = Some(cli.prometheus_url.clone());
    config.prometheus_dialect_override = cli.prometheus_dialect.map(Into::into);
    config.namespaces = cli.namespaces.clone();
    config.kinds = cli.resources.clone();
    config.selector = cli.selector.clone();
    config.job_grouping_labels = cli.job_grouping_labels.clone();
    if let Commands::Ai { llm_url, llm_timeout } = &cli.command {
        config.llm_url = Some(llm_url.clone());
        config.llm_timeout_secs = *llm_timeout;
    }
    config
}

fn build_strategy(cli: &Cli, config: &ScanConfig) -> Result<Arc<dyn Strategy>> {
    let common = StrategyCommon::from_config(config);
    let strategy: Arc<dyn Strategy> = match &cli.command {
        Commands::Simple {
            cpu_percentile,
            memory_buffer_percentage,
            oom_memory_buffer_percentage,
        } => Arc::new(SimpleStrategy::new(
            SimpleSettings {
                cpu_percentile: *cpu_percentile,
                memory_buffer_percentage: *memory_buffer_percentage,
                oom_memory_buffer_percentage: *oom_memory_buffer_percentage,
            },
            common,
        )),
        Commands::SimpleLimit {
            cpu_request_percentile,
            cpu_limit_percentile,
            memory_buffer_percentage,
            oom_memory_buffer_percentage,
        } => Arc::new(SimpleLimitStrategy::new(
            SimpleLimitSettings {
                cpu_request_percentile: *cpu_request_percentile,
                cpu_limit_percentile: *cpu_limit_percentile,
                memory_buffer_percentage: *memory_buffer_percentage,
                oom_memory_buffer_percentage: *oom_memory_buffer_percentage,
            },
            common,
        )),
        Commands::Ai { llm_url, llm_timeout } => {
            let url = url::Url::parse(llm_url)
                .with_context(|| format!("invalid LLM URL {llm_url:?}"))?;
            let client = HttpLlmClient::new(url, Duration::from_secs(*llm_timeout))
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            Arc::new(AiAssistedStrategy::new(common, Arc::new(client)))
        }
    };
    Ok(strategy)
}

async fn kube_client(cli: &Cli, context: Option<&str>) -> Result<kube::Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut kube_config = match &cli.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?
        }
        None if context.is_some() => kube::Config::from_kubeconfig(&options).await?,
        None => kube::Config::infer().await?,
    };

    if let Some(user) = &cli.as_user {
        kube_config.auth_info.impersonate = Some(user.clone());
    }
    if !cli.as_group.is_empty() {
        kube_config.auth_info.impersonate_groups = Some(cli.as_group.clone());
    }

    Ok(kube::Client::try_from(kube_config)?)
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .with_context(|| format!("header {header:?} is not in \"Name: value\" form"))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn parse_kinds(raw: &[String]) -> Result<Vec<WorkloadKind>> {
    raw.iter()
        .map(|name| {
            WorkloadKind::parse(name)
                .with_context(|| format!("unknown workload kind {name:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(&["Authorization: Bearer abc".to_string()]).unwrap();
        assert_eq!(headers, vec![("Authorization".into(), "Bearer abc".into())]);

        assert!(parse_headers(&["no-colon".to_string()]).is_err());
    }

    #[test]
    fn test_parse_kinds() {
        let kinds = parse_kinds(&["deployment".to_string(), "CronJob".to_string()]).unwrap();
        assert_eq!(kinds, vec![WorkloadKind::Deployment, WorkloadKind::CronJob]);

        assert!(parse_kinds(&["Widget".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses_defaults() {
        let cli = Cli::parse_from([
            "krs",
            "--prometheus-url",
            "http://prometheus:9090",
            "simple",
        ]);
        assert_eq!(cli.history_duration, 336.0);
        assert_eq!(cli.max_workers, 10);
        assert!(cli.use_oomkill_data);
        assert!(!cli.allow_hpa);
        match cli.command {
            Commands::Simple { cpu_percentile, .. } => assert_eq!(cpu_percentile, 95.0),
            _ => panic!("expected simple strategy"),
        }
    }

    #[test]
    fn test_cli_strategy_overrides() {
        let cli = Cli::parse_from([
            "krs",
            "--prometheus-url",
            "http://prometheus:9090",
            "simple-limit",
            "--cpu-request-percentile",
            "50",
            "--cpu-limit-percentile",
            "99",
        ]);
        match cli.command {
            Commands::SimpleLimit {
                cpu_request_percentile,
                cpu_limit_percentile,
                ..
            } => {
                assert_eq!(cpu_request_percentile, 50.0);
                assert_eq!(cpu_limit_percentile, 99.0);
            }
            _ => panic!("expected simple-limit strategy"),
        }
    }
}
