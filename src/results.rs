use crate::{
    aggregate::GroupSummary,
    config::{column_names, Configuration},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column holding the optional case name of a measurement
pub const CASE_COLUMN: &str = "case";
/// Column holding the measured throughput in the raw dataset
pub const THROUGHPUT_COLUMN: &str = "bytes_per_second";

/// One measured result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    configuration: Configuration,
    case: Option<String>,
    bytes_per_second: f64,
}

impl Sample {
    pub fn new(configuration: Configuration, case: Option<String>, bytes_per_second: f64) -> Self {
        Self {
            configuration,
            case,
            bytes_per_second,
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Name of the sub-case when the consumer reports several per run
    pub fn case(&self) -> Option<&str> {
        self.case.as_deref()
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_second
    }

    fn to_record(&self) -> Vec<String> {
        let mut record = self.configuration.to_record();
        record.push(self.case.clone().unwrap_or_default());
        record.push(ryu::Buffer::new().format(self.bytes_per_second).to_string());
        record
    }
}

/// Header of the raw dataset: configuration columns, case, throughput
pub fn raw_header() -> Vec<&'static str> {
    let mut header = column_names();
    header.push(CASE_COLUMN);
    header.push(THROUGHPUT_COLUMN);
    header
}

/// Append-only, durable sink for samples
///
/// The header is written on creation and every row is flushed as soon as it
/// is appended, so an interrupted session leaves a readable file behind.
pub struct ResultCollector {
    path: PathBuf,
    writer: csv::Writer<File>,
    samples: Vec<Sample>,
}

impl ResultCollector {
    /// Create (or truncate) the raw dataset file
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create raw dataset {:?}", path))?;
        writer.write_record(raw_header())?;
        writer.flush()?;

        debug!("Raw samples will be written to: {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            samples: Vec::new(),
        })
    }

    /// Persist one sample
    pub fn append(&mut self, sample: Sample) -> Result<()> {
        self.writer
            .write_record(sample.to_record())
            .with_context(|| format!("Failed to append sample to {:?}", self.path))?;
        self.writer.flush()?;
        self.samples.push(sample);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the sink and hand out the collected dataset
    pub fn finalize(mut self) -> Result<RawDataset> {
        self.writer.flush()?;
        info!("{} samples written to: {:?}", self.samples.len(), self.path);
        Ok(RawDataset {
            samples: self.samples,
        })
    }
}

/// Ordered collection of samples, as recorded or as read back from disk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDataset {
    samples: Vec<Sample>,
}

impl RawDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Read a raw dataset written by [`ResultCollector`]
    pub fn read(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to open raw dataset {:?}", path))?;

        let headers = reader.headers()?.clone();
        let expected = raw_header();
        if headers.iter().ne(expected.iter().copied()) {
            bail!(
                "Unexpected header in {:?}: expected {:?}, found {:?}",
                path,
                expected,
                headers.iter().collect::<Vec<_>>()
            );
        }

        let field_count = column_names().len();
        let mut samples = Vec::new();
        for record in reader.records() {
            let record = record.with_context(|| format!("Malformed row in {:?}", path))?;
            let line = record.position().map_or(0, |p| p.line());

            let configuration = Configuration::from_record(record.iter().take(field_count))
                .map_err(|e| anyhow::anyhow!("{:?} line {}: {}", path, line, e))?;
            let case = record
                .get(field_count)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            let throughput = record.get(field_count + 1).unwrap_or_default();
            let bytes_per_second: f64 = throughput.trim().parse().with_context(|| {
                format!("{:?} line {}: invalid throughput '{}'", path, line, throughput)
            })?;

            samples.push(Sample::new(configuration, case, bytes_per_second));
        }

        debug!("Read {} samples from {:?}", samples.len(), path);
        Ok(Self { samples })
    }
}

/// Outcome of the measurement part of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Every scheduled run produced samples
    Completed,
    /// Aggregation of an existing raw dataset, no runs executed
    Reaggregated,
}

/// Session report written as JSON next to the CSV files
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionReport {
    pub metadata: SessionMetadata,
    pub status: SessionStatus,
    pub rows: Vec<GroupSummary>,
    pub warnings: Vec<String>,
}

/// Provenance of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub version: String,
    pub session_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub seed: Option<u64>,
    pub iterations: usize,
    pub configurations: usize,
    pub samples: usize,
    pub raw_dataset: PathBuf,
    pub throughput_unit: String,
    pub system_info: SystemInfo,
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub usable_cpus: Vec<usize>,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            usable_cpus: crate::affinity::available_cpus(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

impl SessionReport {
    /// Write the report as pretty-printed JSON
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write session report {:?}", path))?;
        info!("Session report written to: {:?}", path);
        Ok(())
    }
}
