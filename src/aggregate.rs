//! # Aggregation
//!
//! Reduces the raw dataset to one row per configuration (and case): the
//! arithmetic mean of every sample sharing exactly the same field values.
//! Groups are keyed by value, never by position, so shuffling the raw rows
//! cannot change the result beyond floating-point rounding.

use crate::{
    config::{column_names, Configuration},
    results::{RawDataset, Sample, CASE_COLUMN},
    utils::calculate_stats,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Column holding the mean throughput in the aggregated dataset
pub const MEAN_COLUMN: &str = "mean_bytes_per_second";

/// Mean throughput of one configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRow {
    pub configuration: Configuration,
    pub case: Option<String>,
    pub mean_bytes_per_second: f64,
}

/// Descriptive statistics of one group, for the session report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub configuration: Configuration,
    pub case: Option<String>,
    pub samples: usize,
    pub mean_bytes_per_second: f64,
    pub min_bytes_per_second: f64,
    pub max_bytes_per_second: f64,
    pub std_dev_bytes_per_second: f64,
}

/// Data-quality signal raised while aggregating
///
/// Warnings never prevent the aggregated table from being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationWarning {
    /// Number of groups differs from what a complete session produces
    CardinalityMismatch { expected: usize, observed: usize },
    /// Some groups received fewer samples than others
    UnevenSampleCounts { min: usize, max: usize },
}

impl fmt::Display for AggregationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationWarning::CardinalityMismatch { expected, observed } => write!(
                f,
                "expected {} aggregated rows but found {}; a sample was dropped or misparsed",
                expected, observed
            ),
            AggregationWarning::UnevenSampleCounts { min, max } => write!(
                f,
                "groups hold between {} and {} samples; some runs are missing",
                min, max
            ),
        }
    }
}

/// Result of [`Aggregator::aggregate`]
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// One row per group, sorted by configuration then case
    pub rows: Vec<AggregatedRow>,
    pub summaries: Vec<GroupSummary>,
    pub warnings: Vec<AggregationWarning>,
}

/// Groups samples by their full configuration key
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator {
    expected_configurations: Option<usize>,
}

impl Aggregator {
    /// `expected_configurations` is the size of the configuration space when
    /// the session ran to completion; `None` disables the cardinality check.
    pub fn new(expected_configurations: Option<usize>) -> Self {
        Self {
            expected_configurations,
        }
    }

    pub fn aggregate(&self, dataset: &RawDataset) -> Aggregation {
        let mut groups: BTreeMap<(&Configuration, Option<&str>), Vec<f64>> = BTreeMap::new();
        for sample in dataset.samples() {
            groups
                .entry(group_key(sample))
                .or_default()
                .push(sample.bytes_per_second());
        }

        let mut aggregation = Aggregation::default();
        for ((configuration, case), values) in &groups {
            let (mean, min, max, std_dev) = calculate_stats(values);
            aggregation.rows.push(AggregatedRow {
                configuration: (*configuration).clone(),
                case: case.map(str::to_string),
                mean_bytes_per_second: mean,
            });
            aggregation.summaries.push(GroupSummary {
                configuration: (*configuration).clone(),
                case: case.map(str::to_string),
                samples: values.len(),
                mean_bytes_per_second: mean,
                min_bytes_per_second: min,
                max_bytes_per_second: max,
                std_dev_bytes_per_second: std_dev,
            });
        }

        if let Some(configurations) = self.expected_configurations {
            let cases: BTreeSet<Option<&str>> = groups.keys().map(|(_, case)| *case).collect();
            let expected = configurations * cases.len().max(1);
            if expected != groups.len() {
                aggregation
                    .warnings
                    .push(AggregationWarning::CardinalityMismatch {
                        expected,
                        observed: groups.len(),
                    });
            }
        }

        let counts = groups.values().map(Vec::len);
        if let (Some(min), Some(max)) = (counts.clone().min(), counts.max()) {
            if min != max {
                aggregation
                    .warnings
                    .push(AggregationWarning::UnevenSampleCounts { min, max });
            }
        }

        for warning in &aggregation.warnings {
            warn!("Aggregation warning: {}", warning);
        }
        aggregation
    }
}

fn group_key(sample: &Sample) -> (&Configuration, Option<&str>) {
    (sample.configuration(), sample.case())
}

/// Header of the aggregated dataset: configuration columns, case, mean
pub fn aggregated_header() -> Vec<&'static str> {
    let mut header = column_names();
    header.push(CASE_COLUMN);
    header.push(MEAN_COLUMN);
    header
}

/// Write the aggregated table as CSV
pub fn write_aggregated(path: &Path, rows: &[AggregatedRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create aggregated dataset {:?}", path))?;
    writer.write_record(aggregated_header())?;
    for row in rows {
        let mut record = row.configuration.to_record();
        record.push(row.case.clone().unwrap_or_default());
        record.push(ryu::Buffer::new().format(row.mean_bytes_per_second).to_string());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("{} aggregated rows written to: {:?}", rows.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StrategyFlag;
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    fn base() -> Configuration {
        Configuration::baseline(4096, 1024)
    }

    fn flag_a() -> Configuration {
        base().with_flag(StrategyFlag::WriteWithVmsplice)
    }

    fn sample(configuration: Configuration, value: f64) -> Sample {
        Sample::new(configuration, None, value)
    }

    #[test]
    fn test_two_configurations_two_iterations() {
        let dataset = RawDataset::new(vec![
            sample(base(), 1.0),
            sample(flag_a(), 2.0),
            sample(flag_a(), 2.0),
            sample(base(), 3.0),
        ]);
        let aggregation = Aggregator::new(Some(2)).aggregate(&dataset);

        assert_eq!(aggregation.rows.len(), 2);
        assert!(aggregation.warnings.is_empty());
        let base_row = aggregation
            .rows
            .iter()
            .find(|r| r.configuration == base())
            .unwrap();
        let flag_row = aggregation
            .rows
            .iter()
            .find(|r| r.configuration == flag_a())
            .unwrap();
        assert_eq!(base_row.mean_bytes_per_second, 2.0);
        assert_eq!(flag_row.mean_bytes_per_second, 2.0);
    }

    #[test]
    fn test_row_order_does_not_matter() {
        let mut samples = Vec::new();
        for i in 0..30 {
            let configuration = match i % 3 {
                0 => base(),
                1 => flag_a(),
                _ => base().with_buf_size(2048),
            };
            samples.push(sample(configuration, 1.0 + (i as f64) * 0.37));
        }
        let reference = Aggregator::default().aggregate(&RawDataset::new(samples.clone()));

        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..10 {
            samples.shuffle(&mut rng);
            let shuffled = Aggregator::default().aggregate(&RawDataset::new(samples.clone()));
            assert_eq!(shuffled.rows.len(), reference.rows.len());
            for (a, b) in shuffled.rows.iter().zip(&reference.rows) {
                assert_eq!(a.configuration, b.configuration);
                assert!((a.mean_bytes_per_second - b.mean_bytes_per_second).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_cases_are_separate_groups() {
        let dataset = RawDataset::new(vec![
            Sample::new(base(), Some("cold".to_string()), 1.0),
            Sample::new(base(), Some("warm".to_string()), 5.0),
            Sample::new(base(), Some("cold".to_string()), 3.0),
            Sample::new(base(), Some("warm".to_string()), 7.0),
        ]);
        let aggregation = Aggregator::new(Some(1)).aggregate(&dataset);
        assert_eq!(aggregation.rows.len(), 2);
        assert_eq!(aggregation.rows[0].case.as_deref(), Some("cold"));
        assert_eq!(aggregation.rows[0].mean_bytes_per_second, 2.0);
        assert_eq!(aggregation.rows[1].mean_bytes_per_second, 6.0);
        assert!(aggregation.warnings.is_empty());
    }

    #[test]
    fn test_cardinality_mismatch_is_reported() {
        let dataset = RawDataset::new(vec![sample(base(), 1.0), sample(base(), 2.0)]);
        let aggregation = Aggregator::new(Some(2)).aggregate(&dataset);
        assert_eq!(aggregation.rows.len(), 1);
        assert_eq!(
            aggregation.warnings,
            vec![AggregationWarning::CardinalityMismatch {
                expected: 2,
                observed: 1
            }]
        );
    }

    #[test]
    fn test_uneven_counts_are_reported() {
        let dataset = RawDataset::new(vec![
            sample(base(), 1.0),
            sample(base(), 2.0),
            sample(flag_a(), 2.0),
        ]);
        let aggregation = Aggregator::new(None).aggregate(&dataset);
        assert_eq!(
            aggregation.warnings,
            vec![AggregationWarning::UnevenSampleCounts { min: 1, max: 2 }]
        );
    }

    #[test]
    fn test_empty_dataset() {
        let aggregation = Aggregator::new(None).aggregate(&RawDataset::default());
        assert!(aggregation.rows.is_empty());
        assert!(aggregation.warnings.is_empty());
    }

    #[test]
    fn test_summary_statistics() {
        let dataset = RawDataset::new(vec![sample(base(), 1.0), sample(base(), 3.0)]);
        let summary = &Aggregator::default().aggregate(&dataset).summaries[0];
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.min_bytes_per_second, 1.0);
        assert_eq!(summary.max_bytes_per_second, 3.0);
        assert_eq!(summary.std_dev_bytes_per_second, 1.0);
    }

    #[test]
    fn test_write_aggregated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("data.csv");
        let dataset = RawDataset::new(vec![sample(base(), 1.0), sample(base(), 2.0)]);
        let aggregation = Aggregator::default().aggregate(&dataset);
        write_aggregated(&path, &aggregation.rows).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(lines.next().unwrap(), aggregated_header().join(","));
        let row = lines.next().unwrap();
        assert!(row.starts_with("4096,1024,,0,"));
        assert!(row.ends_with(",,1.5"));
        assert!(lines.next().is_none());
    }
}
