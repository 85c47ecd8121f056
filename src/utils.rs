//! # Utility Functions and Helper Module
//!
//! Helpers shared by the orchestrator and the binary: formatters for
//! human-readable output, validation of user-supplied parameters, summary
//! statistics, host list expansion and plain-text table rendering.
//!
//! ## Key Functionality Categories
//!
//! - **Formatting**: durations, byte counts and bit rates
//! - **Validation**: clear error messages for invalid CLI input
//! - **Statistics**: mean / min / max / standard deviation
//! - **Naming**: run identifiers and filesystem-safe path components
//! - **Display Helpers**: table rows and progress indicators for reports
//!
//! ## Usage Examples
//!
//! ```rust
//! use net_matrix::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_bitrate(9.41e9), "9.41 Gbit/s");
//! assert_eq!(
//!     expand_hostlist("node[01-03]").unwrap(),
//!     vec!["node01", "node02", "node03"]
//! );
//! ```

use anyhow::{bail, Context, Result};
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique identifier for a matrix run
///
/// Combines a caller-chosen label, the first eight characters of a UUID v4
/// and a local timestamp, e.g. `matrix_550e8400_20240131_142501`. The result
/// is used as the run directory name, so it only contains path-safe
/// characters as long as the label does.
pub fn generate_run_id(label: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}",
        label,
        &uuid[..8],
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    )
}

/// Format a duration in a human-readable way
///
/// Automatically selects the most appropriate unit based on the magnitude.
/// Sub-minute values use two decimals; longer values use a compound
/// `1h 2m 3s` form.
///
/// ## Examples
///
/// ```rust
/// # use net_matrix::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a byte count using binary (1024-based) units
///
/// ```rust
/// # use net_matrix::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Format a network bit rate using decimal (1000-based) units
///
/// Network throughput is conventionally reported in powers of ten, matching
/// the figures iperf3 prints itself.
///
/// ```rust
/// # use net_matrix::utils::format_bitrate;
/// assert_eq!(format_bitrate(950.0), "950 bit/s");
/// assert_eq!(format_bitrate(1.5e6), "1.50 Mbit/s");
/// assert_eq!(format_bitrate(9.41e9), "9.41 Gbit/s");
/// ```
pub fn format_bitrate(bits_per_second: f64) -> String {
    if bits_per_second < 1e3 {
        format!("{:.0} bit/s", bits_per_second)
    } else if bits_per_second < 1e6 {
        format!("{:.2} Kbit/s", bits_per_second / 1e3)
    } else if bits_per_second < 1e9 {
        format!("{:.2} Mbit/s", bits_per_second / 1e6)
    } else if bits_per_second < 1e12 {
        format!("{:.2} Gbit/s", bits_per_second / 1e9)
    } else {
        format!("{:.2} Tbit/s", bits_per_second / 1e12)
    }
}

/// Calculate basic statistics for a set of values
///
/// ## Returns
/// Tuple of `(mean, min, max, std_dev)` using the population standard
/// deviation. An empty slice yields all zeros.
///
/// ```rust
/// # use net_matrix::utils::calculate_stats;
/// let (mean, min, max, _) = calculate_stats(&[1.0, 2.0, 3.0, 4.0, 5.0]);
/// assert_eq!((mean, min, max), (3.0, 1.0, 5.0));
/// ```
pub fn calculate_stats(values: &[f64]) -> (f64, f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0, 0.0);
    }

    let sum: f64 = values.iter().sum();
    let count = values.len() as f64;
    let mean = sum / count;

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
    let std_dev = variance.sqrt();

    (mean, min, max, std_dev)
}

/// Validate the base port for benchmark servers
///
/// Ports below 1024 need root privileges to bind, and the allocator hands
/// out `port..port + max_concurrent`, which must stay within `u16`.
pub fn validate_port(port: u16, max_concurrent: usize) -> Result<()> {
    if port < 1024 {
        bail!("Port number {} is too low (below 1024)", port);
    }
    if usize::from(port) + max_concurrent > usize::from(u16::MAX) + 1 {
        bail!(
            "Port range {}..{} exceeds 65535; lower --port or --max-concurrent",
            port,
            usize::from(port) + max_concurrent
        );
    }
    Ok(())
}

/// Validate the number of concurrently running pairs
pub fn validate_concurrency(concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        bail!("Concurrency cannot be zero");
    }
    if concurrency > 1024 {
        bail!("Concurrency {} is too high (maximum 1024)", concurrency);
    }
    Ok(())
}

/// Validate the number of parallel streams per test
///
/// iperf3 rejects more than 128 parallel streams.
pub fn validate_parallel(parallel: u32) -> Result<()> {
    if parallel == 0 {
        bail!("Parallel stream count cannot be zero");
    }
    if parallel > 128 {
        bail!("Parallel stream count {} is too high (maximum 128)", parallel);
    }
    Ok(())
}

/// Validate the measured test duration
///
/// iperf3 only accepts whole seconds.
pub fn validate_duration(duration: Duration) -> Result<()> {
    if duration < Duration::from_secs(1) {
        bail!(
            "Test duration {} is too short (minimum 1s)",
            format_duration(duration)
        );
    }
    if duration.subsec_nanos() != 0 {
        bail!(
            "Test duration {} is not a whole number of seconds",
            format_duration(duration)
        );
    }
    Ok(())
}

/// Make a node name safe to use as a single path component
///
/// Characters outside `[A-Za-z0-9.-]` are percent-encoded, and so is a
/// leading dot. `_` is encoded too, which keeps `__` free to act as a
/// separator between two encoded names without collisions.
///
/// ```rust
/// # use net_matrix::utils::sanitize_path_component;
/// assert_eq!(sanitize_path_component("node-01.ib"), "node-01.ib");
/// assert_eq!(sanitize_path_component("a/b_c"), "a%2Fb%5Fc");
/// assert_eq!(sanitize_path_component(".."), "%2E.");
/// ```
pub fn sanitize_path_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Split a host list on commas that are not inside brackets.
fn split_hostlist(list: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .with_context(|| format!("Unbalanced ']' in host list '{}'", list))?
            }
            ',' if depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        bail!("Unbalanced '[' in host list '{}'", list);
    }
    parts.push(&list[start..]);
    Ok(parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect())
}

/// Expand a Slurm-style host list
///
/// Supports comma separated names and one bracketed range group per name,
/// with zero padding preserved: `node[01-03,07],login` expands to
/// `node01 node02 node03 node07 login`.
pub fn expand_hostlist(list: &str) -> Result<Vec<String>> {
    let mut hosts = Vec::new();
    for part in split_hostlist(list)? {
        let Some(open) = part.find('[') else {
            hosts.push(part.to_string());
            continue;
        };
        let close = part[open..]
            .find(']')
            .map(|i| i + open)
            .with_context(|| format!("Missing ']' in host list entry '{}'", part))?;
        let (prefix, suffix) = (&part[..open], &part[close + 1..]);

        for range in part[open + 1..close].split(',') {
            let (low, high) = range.split_once('-').unwrap_or((range, range));
            let width = low.len();
            let low_n: u64 = low
                .parse()
                .with_context(|| format!("Invalid range bound '{}' in '{}'", low, part))?;
            let high_n: u64 = high
                .parse()
                .with_context(|| format!("Invalid range bound '{}' in '{}'", high, part))?;
            if high_n < low_n {
                bail!("Descending range '{}' in '{}'", range, part);
            }
            for n in low_n..=high_n {
                hosts.push(format!("{}{:0width$}{}", prefix, n, suffix, width = width));
            }
        }
    }
    Ok(hosts)
}

/// Get the number of CPU cores available to this process
pub fn get_cpu_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Format a table row
///
/// Each column is left-aligned and padded to its width; columns without a
/// width entry default to 10 characters.
///
/// ```text
/// | Server         | Client         | Throughput   |
/// ```
pub fn format_table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut row = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        row.push_str(&format!(" {:width$} |", column, width = width));
    }
    row
}

/// Format a table separator matching [`format_table_row`]
///
/// ```text
/// +----------------+----------------+--------------+
/// ```
pub fn format_table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

/// Create a progress bar-like indicator
///
/// ```rust
/// # use net_matrix::utils::create_progress_indicator;
/// assert_eq!(create_progress_indicator(5, 10, 10), "█████░░░░░");
/// ```
pub fn create_progress_indicator(current: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return "█".repeat(width);
    }

    let progress = (current as f64 / total as f64).min(1.0);
    let filled = ((progress * width as f64) as usize).min(width);
    let empty = width - filled;

    format!("{}{}", "█".repeat(filled), "░".repeat(empty))
}
