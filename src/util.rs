use std::path::Path;
use std::thread;

use anyhow::{anyhow, Result};

/// Parses a human size string ("125M", "64Ki", "1.5Gi") into bytes.
pub fn parse_size(input: &str) -> Result<u64> {
    let normalized = input.trim();
    if normalized.is_empty() {
        return Err(anyhow!("size cannot be empty"));
    }

    let mut number_part = String::new();
    let mut suffix_part = String::new();
    for ch in normalized.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number_part.push(ch);
        } else {
            suffix_part.push(ch);
        }
    }

    let value: f64 = number_part
        .parse()
        .map_err(|_| anyhow!("invalid numeric value in size: {normalized}"))?;

    let multiplier = match suffix_part.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1_000.0,
        "ki" | "kib" => 1024.0,
        "m" | "mb" => 1_000_000.0,
        "mi" | "mib" => 1_048_576.0,
        "g" | "gb" => 1_000_000_000.0,
        "gi" | "gib" => 1_073_741_824.0,
        other => return Err(anyhow!("unsupported size suffix: {other}")),
    };

    let bytes = (value * multiplier).round();
    if bytes < 1.0 {
        return Err(anyhow!("size must be at least one byte"));
    }

    Ok(bytes as u64)
}

pub fn format_bytes(value: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut val = value as f64;
    let mut unit = 0usize;
    while val >= 1024.0 && unit < UNITS.len() - 1 {
        val /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value, UNITS[unit])
    } else {
        format!("{val:.2} {}", UNITS[unit])
    }
}

/// Refuses to clobber an existing destination unless `force` is set.
pub fn ensure_destination_not_exist(dest: &Path, force: bool) -> Result<()> {
    if !force && dest.exists() {
        return Err(anyhow!("destination {} already exists", dest.display()));
    }
    Ok(())
}

/// Default per-file chunk concurrency: four requests per core.
pub fn default_concurrency() -> usize {
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    cores * 4
}
