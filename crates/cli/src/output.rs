//! Report formatters
//!
//! Renders a scan report as a colored table, JSON, YAML or CSV. The table
//! shows current against recommended allocations; cells are colored by how
//! far apart the two sit.

use anyhow::Result;
use clap::ValueEnum;
use colored::Colorize;
use scanner_lib::quantity::{format_bytes, format_millicores};
use scanner_lib::{Recommendation, ScanReport, ScanResult, Severity};
use tabled::{settings::Style, Table, Tabled};

/// Output format for the scan report
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// CSV format
    Csv,
}

#[derive(Tabled)]
struct ReportRow {
    #[tabled(rename = "Workload")]
    workload: String,
    #[tabled(rename = "Container")]
    container: String,
    #[tabled(rename = "Pods")]
    pods: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "CPU Request")]
    cpu_request: String,
    #[tabled(rename = "CPU Limit")]
    cpu_limit: String,
    #[tabled(rename = "Memory Request")]
    memory_request: String,
    #[tabled(rename = "Memory Limit")]
    memory_limit: String,
    #[tabled(rename = "Info")]
    info: String,
}

/// Print the report in the requested format.
pub fn print_report(report: &ScanReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => print_table(report),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
            Ok(())
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(report)?);
            Ok(())
        }
        OutputFormat::Csv => print_csv(report),
    }
}

fn print_table(report: &ScanReport) -> Result<()> {
    if report.results.is_empty() {
        println!("{}", "No workloads scanned".yellow());
    } else {
        let rows: Vec<ReportRow> = report.results.iter().map(table_row).collect();
        let table = Table::new(rows).with(Style::rounded()).to_string();
        println!("{table}");
    }

    for failure in &report.cluster_failures {
        println!(
            "{} cluster {} was not scanned: {}",
            "⚠".yellow().bold(),
            failure.cluster.bold(),
            failure.error
        );
    }

    println!(
        "{} {} rows from {} cluster(s) using the {} strategy",
        "ℹ".blue().bold(),
        report.results.len(),
        report.scanned_clusters,
        report.strategy
    );
    Ok(())
}

fn table_row(result: &ScanResult) -> ReportRow {
    let workload = if result.cluster.is_empty() {
        format!("{} {}/{}", result.kind, result.namespace, result.name)
    } else {
        format!(
            "[{}] {} {}/{}",
            result.cluster, result.kind, result.namespace, result.name
        )
    };

    let cpu_request_severity = Severity::for_cpu(
        result.current.cpu_request,
        result.recommended.cpu_request_millicores.value(),
    );
    let cpu_limit_severity = Severity::for_cpu(
        result.current.cpu_limit,
        result.recommended.cpu_limit_millicores.value(),
    );
    let memory_request_severity = Severity::for_memory(
        result.current.memory_request,
        result.recommended.memory_request_bytes.value(),
    );
    let memory_limit_severity = Severity::for_memory(
        result.current.memory_limit,
        result.recommended.memory_limit_bytes.value(),
    );

    let mut info: Vec<String> = result.info.values().cloned().collect();
    info.extend(result.warnings.iter().map(|w| w.to_string()));

    ReportRow {
        workload,
        container: result.container.clone(),
        pods: format!("{}/{}", result.pods_active, result.pods_total),
        state: color_state(&result.state.to_string()),
        cpu_request: color_severity(
            cpu_request_severity,
            &cpu_cell(
                result.current.cpu_request,
                result.recommended.cpu_request_millicores,
            ),
        ),
        cpu_limit: color_severity(
            cpu_limit_severity,
            &cpu_cell(
                result.current.cpu_limit,
                result.recommended.cpu_limit_millicores,
            ),
        ),
        memory_request: color_severity(
            memory_request_severity,
            &memory_cell(
                result.current.memory_request,
                result.recommended.memory_request_bytes,
            ),
        ),
        memory_limit: color_severity(
            memory_limit_severity,
            &memory_cell(
                result.current.memory_limit,
                result.recommended.memory_limit_bytes,
            ),
        ),
        info: info.join(", "),
    }
}

fn cpu_cell(current_cores: Option<f64>, recommended: Recommendation) -> String {
    let current = match current_cores {
        Some(cores) => format_millicores((cores * 1000.0).round() as u64),
        None => "none".to_string(),
    };
    format!("{current} -> {}", recommendation_cpu(recommended))
}

fn memory_cell(current_bytes: Option<f64>, recommended: Recommendation) -> String {
    let current = match current_bytes {
        Some(bytes) => format_bytes(bytes as u64),
        None => "none".to_string(),
    };
    format!("{current} -> {}", recommendation_memory(recommended))
}

fn recommendation_cpu(value: Recommendation) -> String {
    match value {
        Recommendation::Value(millicores) => format_millicores(millicores),
        Recommendation::Unset => "unset".to_string(),
        Recommendation::Undefined => "?".to_string(),
    }
}

fn recommendation_memory(value: Recommendation) -> String {
    match value {
        Recommendation::Value(bytes) => format_bytes(bytes),
        Recommendation::Unset => "unset".to_string(),
        Recommendation::Undefined => "?".to_string(),
    }
}

fn color_severity(severity: Severity, text: &str) -> String {
    match severity {
        Severity::Critical => text.red().to_string(),
        Severity::Warning => text.yellow().to_string(),
        Severity::Ok => text.normal().to_string(),
        Severity::Good => text.green().to_string(),
        Severity::Unknown => text.dimmed().to_string(),
    }
}

fn color_state(state: &str) -> String {
    match state {
        "ok" => state.green().to_string(),
        "clamped" => state.yellow().to_string(),
        "undefined" => state.dimmed().to_string(),
        "ineligible" => state.yellow().to_string(),
        _ => state.to_string(),
    }
}

fn print_csv(report: &ScanReport) -> Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record([
        "cluster",
        "namespace",
        "kind",
        "name",
        "container",
        "pods_active",
        "pods_total",
        "state",
        "cpu_request_millicores",
        "cpu_limit_millicores",
        "memory_request_bytes",
        "memory_limit_bytes",
        "info",
    ])?;

    for result in &report.results {
        writer.write_record([
            result.cluster.clone(),
            result.namespace.clone(),
            result.kind.to_string(),
            result.name.clone(),
            result.container.clone(),
            result.pods_active.to_string(),
            result.pods_total.to_string(),
            result.state.to_string(),
            csv_value(result.recommended.cpu_request_millicores),
            csv_value(result.recommended.cpu_limit_millicores),
            csv_value(result.recommended.memory_request_bytes),
            csv_value(result.recommended.memory_limit_bytes),
            result
                .info
                .values()
                .cloned()
                .collect::<Vec<_>>()
                .join("; "),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn csv_value(value: Recommendation) -> String {
    match value {
        Recommendation::Value(v) => v.to_string(),
        Recommendation::Unset => String::new(),
        Recommendation::Undefined => "?".to_string(),
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommendation_rendering() {
        assert_eq!(recommendation_cpu(Recommendation::Value(185)), "185m");
        assert_eq!(recommendation_cpu(Recommendation::Unset), "unset");
        assert_eq!(recommendation_cpu(Recommendation::Undefined), "?");
        assert_eq!(
            recommendation_memory(Recommendation::Value(805 * 1024 * 1024)),
            "805Mi"
        );
    }

    #[test]
    fn test_cells_show_current_and_recommended() {
        let cell = cpu_cell(Some(0.5), Recommendation::Value(185));
        assert_eq!(cell, "500m -> 185m");

        let cell = memory_cell(None, Recommendation::Undefined);
        assert_eq!(cell, "none -> ?");
    }

    #[test]
    fn test_csv_values() {
        assert_eq!(csv_value(Recommendation::Value(42)), "42");
        assert_eq!(csv_value(Recommendation::Unset), "");
        assert_eq!(csv_value(Recommendation::Undefined), "?");
    }
}
