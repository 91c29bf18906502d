//! # Utility Functions and Helper Module
//!
//! Formatting of sizes and rates, descriptive statistics, and the console
//! table helpers used for the final comparison table.
//!
//! ## Usage Examples
//!
//! ```rust
//! use pipe_bench::utils::*;
//!
//! assert_eq!(format_size(128 * 1024), "128KiB");
//! assert_eq!(format_rate(1.5 * 1024.0 * 1024.0 * 1024.0), "1.50 GiB/s");
//! ```

use uuid::Uuid;

/// Generate a unique identifier for a measurement session
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a byte count using the largest binary unit that divides it exactly
///
/// Configuration sizes are almost always powers of two, so this keeps them
/// short without losing precision.
///
/// ```rust
/// # use pipe_bench::utils::format_size;
/// assert_eq!(format_size(10 << 30), "10GiB");
/// assert_eq!(format_size(1 << 20), "1MiB");
/// assert_eq!(format_size(3 << 10), "3KiB");
/// assert_eq!(format_size(1000), "1000B");
/// ```
pub fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1 << 30;
    const MIB: u64 = 1 << 20;
    const KIB: u64 = 1 << 10;

    if bytes == 0 {
        "0B".to_string()
    } else if bytes % GIB == 0 {
        format!("{}GiB", bytes / GIB)
    } else if bytes % MIB == 0 {
        format!("{}MiB", bytes / MIB)
    } else if bytes % KIB == 0 {
        format!("{}KiB", bytes / KIB)
    } else {
        format!("{}B", bytes)
    }
}

/// Format a throughput in bytes per second with binary units
///
/// ```rust
/// # use pipe_bench::utils::format_rate;
/// assert_eq!(format_rate(512.0), "512 B/s");
/// assert_eq!(format_rate(1536.0), "1.50 KiB/s");
/// assert_eq!(format_rate(2621440.0), "2.50 MiB/s");
/// ```
pub fn format_rate(bytes_per_second: f64) -> String {
    let value = bytes_per_second;
    if value < 1024.0 {
        format!("{:.0} B/s", value)
    } else if value < 1024.0 * 1024.0 {
        format!("{:.2} KiB/s", value / 1024.0)
    } else if value < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MiB/s", value / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GiB/s", value / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Calculate statistics from a vector of values
///
/// Returns `(mean, min, max, standard_deviation)`, using the population
/// standard deviation. An empty slice yields all zeros.
///
/// ```rust
/// # use pipe_bench::utils::calculate_stats;
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

/// Render one table row, padding every column to its width
pub fn format_table_row(columns: &[&str], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        line.push_str(&format!(" {:width$} |", column, width = width));
    }
    line
}

/// Render a table separator matching the column widths
///
/// ```text
/// +---------+----------+
/// | Payload | Mean     |
/// +---------+----------+
/// ```
pub fn format_table_separator(widths: &[usize]) -> String {
    let mut line = String::from("+");
    for &width in widths {
        line.push_str(&"-".repeat(width + 2));
        line.push('+');
    }
    line
}

/// Width needed for each column so every cell fits
pub fn column_widths(header: &[&str], rows: &[Vec<String>]) -> Vec<usize> {
    header
        .iter()
        .enumerate()
        .map(|(i, title)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.chars().count())
                .chain(std::iter::once(title.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect()
}

/// Create a progress bar-like indicator
///
/// ```rust
/// # use pipe_bench::utils::create_progress_indicator;
/// assert_eq!(create_progress_indicator(0, 100, 10), "░░░░░░░░░░");
/// assert_eq!(create_progress_indicator(50, 100, 10), "█████░░░░░");
/// assert_eq!(create_progress_indicator(100, 100, 10), "██████████");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0B");
        assert_eq!(format_size(1 << 15), "32KiB");
        assert_eq!(format_size(1 << 23), "8MiB");
        assert_eq!(format_size(10 << 30), "10GiB");
        assert_eq!(format_size(1536), "1536B");
    }

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0.0), "0 B/s");
        assert_eq!(format_rate(1024.0 * 1024.0 * 1024.0 * 12.25), "12.25 GiB/s");
    }

    /// Test statistical calculations with known dataset
    #[test]
    fn test_calculate_stats() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let (mean, min, max, std_dev) = calculate_stats(&values);

        assert_eq!(mean, 3.0);
        assert_eq!(min, 1.0);
        assert_eq!(max, 5.0);
        assert!((std_dev - 1.4142135623730951).abs() < 0.001);

        assert_eq!(calculate_stats(&[]), (0.0, 0.0, 0.0, 0.0));
    }

    #[test]
    fn test_table_helpers() {
        let header = ["Buf", "Mean"];
        let rows = vec![vec!["128KiB".to_string(), "1.00 GiB/s".to_string()]];
        let widths = column_widths(&header, &rows);
        assert_eq!(widths, vec![6, 10]);
        assert_eq!(format_table_separator(&widths), "+--------+------------+");
        assert_eq!(format_table_row(&header, &widths), "| Buf    | Mean       |");
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn test_create_progress_indicator() {
        assert_eq!(create_progress_indicator(0, 100, 10), "░░░░░░░░░░");
        assert_eq!(create_progress_indicator(50, 100, 10), "█████░░░░░");
        assert_eq!(create_progress_indicator(100, 100, 10), "██████████");
        assert_eq!(create_progress_indicator(0, 0, 4), "████");
    }
}
