//! Kubernetes resource quantity parsing and formatting
//!
//! Container specs declare CPU as `100m` / `1.5` and memory as `128Mi` /
//! `1G` / plain bytes. Parsing happens once at discovery; formatting is
//! used by report formatters.

/// Parse a CPU quantity string into cores.
pub fn parse_cpu(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();

    if let Some(nanos) = quantity.strip_suffix('n') {
        return nanos.parse::<f64>().ok().map(|n| n / 1_000_000_000.0);
    }
    if let Some(micros) = quantity.strip_suffix('u') {
        return micros.parse::<f64>().ok().map(|u| u / 1_000_000.0);
    }
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse::<f64>().ok().map(|m| m / 1000.0);
    }
    quantity.parse::<f64>().ok()
}

/// Parse a memory quantity string into bytes.
pub fn parse_memory(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split_at = quantity
        .char_indices()
        .find(|(_, c)| c.is_alphabetic())
        .map(|(idx, _)| idx)
        .unwrap_or(quantity.len());
    let (number, unit) = quantity.split_at(split_at);
    let value = number.parse::<f64>().ok()?;

    let multiplier: f64 = match unit {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "k" | "K" => 1000.0,
        "M" => 1000.0 * 1000.0,
        "G" => 1000.0 * 1000.0 * 1000.0,
        "T" => 1000.0_f64.powi(4),
        _ => return None,
    };

    Some(value * multiplier)
}

/// Format bytes in the binary units Kubernetes manifests use.
pub fn format_bytes(bytes: u64) -> String {
    const KI: u64 = 1024;
    const MI: u64 = KI * 1024;
    const GI: u64 = MI * 1024;

    if bytes >= GI {
        format!("{:.2}Gi", bytes as f64 / GI as f64)
    } else if bytes >= MI {
        format!("{:.0}Mi", bytes as f64 / MI as f64)
    } else if bytes >= KI {
        format!("{:.0}Ki", bytes as f64 / KI as f64)
    } else {
        format!("{bytes}")
    }
}

/// Format millicores, switching to whole cores at 1000m.
pub fn format_millicores(millicores: u64) -> String {
    if millicores >= 1000 && millicores % 100 == 0 {
        format!("{:.1}", millicores as f64 / 1000.0)
    } else {
        format!("{millicores}m")
    }
}
