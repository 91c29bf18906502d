//! # Measurement Session
//!
//! A [`Session`] owns one measurement campaign from start to finish:
//!
//! 1. **new**: generate and validate the configuration space, open the raw
//!    dataset
//! 2. **run**: execute the randomized schedule one process pair at a time,
//!    persisting every sample as soon as it arrives
//! 3. **finalize**: aggregate the raw dataset, write the aggregated table and
//!    the JSON report, print the comparison table
//!
//! The first failed run aborts the session. Samples collected up to that
//! point stay in the raw dataset; aggregating them is an explicit decision
//! ([`Session::into_raw_dataset`] or `--aggregate-only`).

use crate::{
    aggregate::{write_aggregated, Aggregation, Aggregator, GroupSummary},
    cli::Args,
    config::Configuration,
    error::ExperimentFailure,
    results::{RawDataset, ResultCollector, SessionMetadata, SessionReport, SessionStatus, SystemInfo},
    runner::ExperimentRunner,
    schedule::ExperimentSchedule,
    space::ConfigurationSpace,
    utils::{
        column_widths, create_progress_indicator, format_rate, format_size, format_table_row,
        format_table_separator, generate_session_id,
    },
};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Everything a session needs besides its runner
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub space: ConfigurationSpace,
    pub iterations: usize,
    pub seed: Option<u64>,
    pub raw_output: PathBuf,
    pub aggregated_output: PathBuf,
    pub summary_output: Option<PathBuf>,
}

impl SessionSettings {
    /// Build session settings from the command line
    pub fn from_args(args: &Args) -> Result<Self> {
        let bytes_to_pipe = *args
            .bytes_to_pipe
            .first()
            .context("At least one --bytes-to-pipe value is required")?;
        let buf_size = *args
            .buf_size
            .first()
            .context("At least one --buf-size value is required")?;

        let baseline = args.always.iter().fold(
            Configuration::baseline(bytes_to_pipe, buf_size).with_pipe_size(args.pipe_size),
            |configuration, flag| configuration.with_flag(*flag),
        );

        Ok(Self {
            space: ConfigurationSpace::new(
                baseline,
                args.toggle.clone(),
                args.bytes_to_pipe.clone(),
                args.buf_size.clone(),
            ),
            iterations: args.iterations,
            seed: args.seed,
            raw_output: args.raw_output.clone(),
            aggregated_output: args.aggregated_output.clone(),
            summary_output: args.summary_output.clone(),
        })
    }
}

/// One measurement campaign
pub struct Session<R: ExperimentRunner> {
    settings: SessionSettings,
    configurations: Vec<Configuration>,
    runner: R,
    collector: ResultCollector,
    session_id: String,
    started_at: DateTime<Utc>,
    seed: Option<u64>,
    started: bool,
    completed: bool,
}

impl<R: ExperimentRunner> Session<R> {
    /// Generate the configuration space, validate it and open the raw dataset
    ///
    /// An inconsistent configuration is reported here, before any process is
    /// spawned or any file is created.
    pub fn new(settings: SessionSettings, runner: R) -> Result<Self> {
        let configurations = settings.space.generate();
        for configuration in &configurations {
            configuration
                .validate()
                .map_err(|reason| ExperimentFailure::Configuration {
                    configuration: Box::new(configuration.clone()),
                    reason,
                })?;
        }

        let collector = ResultCollector::create(&settings.raw_output)?;
        let session_id = generate_session_id();
        info!(
            "Session {}: {} configurations x {} iterations",
            session_id,
            configurations.len(),
            settings.iterations
        );

        Ok(Self {
            settings,
            configurations,
            runner,
            collector,
            session_id,
            started_at: Utc::now(),
            seed: None,
            started: false,
            completed: false,
        })
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Samples persisted so far
    pub fn samples_collected(&self) -> usize {
        self.collector.len()
    }

    /// Execute the whole schedule, one run at a time
    ///
    /// Stops at the first failed run; the returned error has the
    /// [`ExperimentFailure`] as its root cause. A session runs at most once.
    pub async fn run(&mut self) -> Result<()> {
        if self.started {
            bail!(
                "Session {} has already been run; start a new session to measure again",
                self.session_id
            );
        }
        self.started = true;

        let schedule = ExperimentSchedule::new(
            &self.configurations,
            self.settings.iterations,
            self.settings.seed,
        );
        self.seed = Some(schedule.seed());
        let total = schedule.len();
        info!("Schedule seed: {} ({} runs)", schedule.seed(), total);

        for (index, run) in schedule.enumerate() {
            info!(
                "{} run {}/{} (iteration {}): {}",
                create_progress_indicator(index, total, 20),
                index + 1,
                total,
                run.iteration + 1,
                run.configuration
            );

            match self.runner.run(run.configuration).await {
                Ok(samples) => {
                    for sample in samples {
                        debug!(
                            "  {}{}",
                            sample
                                .case()
                                .map(|c| format!("{}: ", c))
                                .unwrap_or_default(),
                            format_rate(sample.bytes_per_second())
                        );
                        self.collector.append(sample)?;
                    }
                }
                Err(failure) => {
                    error!("Run failed ({}): {}", failure.kind(), failure);
                    let kept = self.collector.len();
                    let path = self.collector.path().to_path_buf();
                    return Err(anyhow::Error::new(failure).context(format!(
                        "Session aborted at run {} of {}; {} samples kept in {:?}",
                        index + 1,
                        total,
                        kept,
                        path
                    )));
                }
            }
        }

        self.completed = true;
        info!("All {} runs completed", total);
        Ok(())
    }

    /// Close the raw dataset without aggregating, e.g. after a failed run
    pub fn into_raw_dataset(self) -> Result<RawDataset> {
        self.collector.finalize()
    }

    /// Aggregate, write the aggregated table and report, print the comparison
    ///
    /// Only a session whose schedule ran to completion can be finalized.
    pub fn finalize(self) -> Result<SessionReport> {
        if !self.completed {
            bail!(
                "Session {} did not complete; aggregate {:?} explicitly if the partial data is wanted",
                self.session_id,
                self.collector.path()
            );
        }

        let raw_dataset = self.collector.path().to_path_buf();
        let dataset = self.collector.finalize()?;
        let expected = self.configurations.len() * self.settings.iterations.min(1);
        let aggregation = Aggregator::new(Some(expected)).aggregate(&dataset);
        write_aggregated(&self.settings.aggregated_output, &aggregation.rows)?;
        print_comparison_table(&aggregation.summaries);

        let report = build_report(
            SessionMetadata {
                version: crate::VERSION.to_string(),
                session_id: self.session_id,
                started_at: self.started_at,
                finished_at: Utc::now(),
                seed: self.seed,
                iterations: self.settings.iterations,
                configurations: self.configurations.len(),
                samples: dataset.len(),
                raw_dataset,
                throughput_unit: crate::defaults::THROUGHPUT_UNIT.to_string(),
                system_info: SystemInfo::collect(),
            },
            SessionStatus::Completed,
            aggregation,
        );
        if let Some(path) = &self.settings.summary_output {
            report.write(path)?;
        }
        Ok(report)
    }
}

/// Aggregate an existing raw dataset without running anything
pub fn reaggregate(
    raw_dataset: &Path,
    aggregated_output: &Path,
    summary_output: Option<&Path>,
) -> Result<SessionReport> {
    let started_at = Utc::now();
    let dataset = RawDataset::read(raw_dataset)?;
    info!("Re-aggregating {} samples from {:?}", dataset.len(), raw_dataset);

    let aggregation = Aggregator::new(None).aggregate(&dataset);
    write_aggregated(aggregated_output, &aggregation.rows)?;
    print_comparison_table(&aggregation.summaries);

    let configurations = dataset
        .samples()
        .iter()
        .map(|s| s.configuration())
        .collect::<BTreeSet<_>>()
        .len();
    let report = build_report(
        SessionMetadata {
            version: crate::VERSION.to_string(),
            session_id: generate_session_id(),
            started_at,
            finished_at: Utc::now(),
            seed: None,
            iterations: 0,
            configurations,
            samples: dataset.len(),
            raw_dataset: raw_dataset.to_path_buf(),
            throughput_unit: crate::defaults::THROUGHPUT_UNIT.to_string(),
            system_info: SystemInfo::collect(),
        },
        SessionStatus::Reaggregated,
        aggregation,
    );
    if let Some(path) = summary_output {
        report.write(path)?;
    }
    Ok(report)
}

fn build_report(
    metadata: SessionMetadata,
    status: SessionStatus,
    aggregation: Aggregation,
) -> SessionReport {
    SessionReport {
        metadata,
        status,
        rows: aggregation.summaries,
        warnings: aggregation.warnings.iter().map(|w| w.to_string()).collect(),
    }
}

/// Print the configuration space, one line per configuration
pub fn print_configuration_space(configurations: &[Configuration]) {
    for (i, configuration) in configurations.iter().enumerate() {
        println!("{:>3}  {}", i + 1, configuration);
    }
}

/// Print mean throughput per configuration, with the gain over the first
/// configuration of the same sizes (the baseline of each chain)
fn print_comparison_table(summaries: &[GroupSummary]) {
    if summaries.is_empty() {
        println!("No samples to report.");
        return;
    }

    let with_cases = summaries.iter().any(|s| s.case.is_some());
    let mut header = vec!["Payload", "Buffer", "Pipe", "Strategy"];
    if with_cases {
        header.push("Case");
    }
    header.extend(["Samples", "Mean", "Std Dev", "Gain"]);

    let rows: Vec<Vec<String>> = summaries
        .iter()
        .map(|summary| {
            let configuration = &summary.configuration;
            let reference = summaries
                .iter()
                .find(|other| same_chain(other, summary))
                .map_or(summary.mean_bytes_per_second, |r| r.mean_bytes_per_second);
            let flags: Vec<&str> = configuration.enabled_flags().map(|f| f.name()).collect();

            let mut row = vec![
                format_size(configuration.bytes_to_pipe()),
                format_size(configuration.buf_size()),
                configuration
                    .pipe_size()
                    .map_or_else(|| "-".to_string(), format_size),
                if flags.is_empty() {
                    "baseline".to_string()
                } else {
                    flags.join("+")
                },
            ];
            if with_cases {
                row.push(summary.case.clone().unwrap_or_default());
            }
            row.push(summary.samples.to_string());
            row.push(format_rate(summary.mean_bytes_per_second));
            row.push(format_rate(summary.std_dev_bytes_per_second));
            row.push(if reference > 0.0 {
                format!("x{:.2}", summary.mean_bytes_per_second / reference)
            } else {
                "-".to_string()
            });
            row
        })
        .collect();

    let widths = column_widths(&header, &rows);
    println!("{}", format_table_separator(&widths));
    println!("{}", format_table_row(&header, &widths));
    println!("{}", format_table_separator(&widths));
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        println!("{}", format_table_row(&cells, &widths));
    }
    println!("{}", format_table_separator(&widths));
}

fn same_chain(a: &GroupSummary, b: &GroupSummary) -> bool {
    a.case == b.case
        && a.configuration.bytes_to_pipe() == b.configuration.bytes_to_pipe()
        && a.configuration.buf_size() == b.configuration.buf_size()
        && a.configuration.pipe_size() == b.configuration.pipe_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::StrategyFlag;
    use crate::results::Sample;
    use async_trait::async_trait;
    use clap::Parser;
    use std::collections::HashMap;
    use tempfile::{tempdir, TempDir};

    /// Replays scripted throughputs per configuration, failing on a chosen call
    struct ScriptedRunner {
        values: HashMap<Configuration, Vec<f64>>,
        fail_on_call: Option<usize>,
        calls: usize,
    }

    #[async_trait]
    impl ExperimentRunner for ScriptedRunner {
        async fn run(
            &mut self,
            configuration: &Configuration,
        ) -> Result<Vec<Sample>, ExperimentFailure> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                return Err(ExperimentFailure::Runtime {
                    configuration: Box::new(configuration.clone()),
                    role: crate::error::Role::Consumer,
                    status: "exit status: 1".to_string(),
                    stderr: String::new(),
                });
            }
            let value = self
                .values
                .get_mut(configuration)
                .and_then(|v| v.pop())
                .unwrap_or(1.0);
            Ok(vec![Sample::new(configuration.clone(), None, value)])
        }
    }

    fn settings(dir: &TempDir, toggles: Vec<StrategyFlag>, iterations: usize) -> SessionSettings {
        SessionSettings {
            space: ConfigurationSpace::new(
                Configuration::baseline(4096, 1024),
                toggles,
                vec![],
                vec![],
            ),
            iterations,
            seed: Some(5),
            raw_output: dir.path().join("raw-data.csv"),
            aggregated_output: dir.path().join("data.csv"),
            summary_output: Some(dir.path().join("summary.json")),
        }
    }

    #[tokio::test]
    async fn test_two_configurations_two_iterations() {
        let dir = tempdir().unwrap();
        let base = Configuration::baseline(4096, 1024);
        let flag_a = base.with_flag(StrategyFlag::WriteWithVmsplice);
        let runner = ScriptedRunner {
            values: HashMap::from([
                (base.clone(), vec![1.0, 3.0]),
                (flag_a.clone(), vec![2.0, 2.0]),
            ]),
            fail_on_call: None,
            calls: 0,
        };

        let mut session = Session::new(
            settings(&dir, vec![StrategyFlag::WriteWithVmsplice], 2),
            runner,
        )
        .unwrap();
        assert_eq!(session.configurations(), &[base.clone(), flag_a.clone()]);
        session.run().await.unwrap();
        assert_eq!(session.samples_collected(), 4);

        let report = session.finalize().unwrap();
        assert_eq!(report.status, SessionStatus::Completed);
        assert_eq!(report.metadata.seed, Some(5));
        assert_eq!(report.rows.len(), 2);
        assert!(report.warnings.is_empty());
        for row in &report.rows {
            assert_eq!(row.mean_bytes_per_second, 2.0);
            assert_eq!(row.samples, 2);
        }

        assert_eq!(RawDataset::read(&dir.path().join("raw-data.csv")).unwrap().len(), 4);
        let aggregated = std::fs::read_to_string(dir.path().join("data.csv")).unwrap();
        assert_eq!(aggregated.lines().count(), 3);
        let json = std::fs::read_to_string(dir.path().join("summary.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["status"], "completed");
    }

    #[tokio::test]
    async fn test_failure_aborts_and_keeps_earlier_samples() {
        let dir = tempdir().unwrap();
        let runner = ScriptedRunner {
            values: HashMap::new(),
            fail_on_call: Some(2),
            calls: 0,
        };
        let mut session = Session::new(
            settings(&dir, vec![StrategyFlag::WriteWithVmsplice], 3),
            runner,
        )
        .unwrap();

        let err = session.run().await.unwrap_err();
        let failure = err.downcast_ref::<ExperimentFailure>().unwrap();
        assert_eq!(failure.kind(), "runtime");
        assert_eq!(session.samples_collected(), 1);
        assert_eq!(session.runner.calls, 2);

        let raw = RawDataset::read(&dir.path().join("raw-data.csv")).unwrap();
        assert_eq!(raw.len(), 1);

        assert!(session.finalize().is_err());
        assert!(!dir.path().join("data.csv").exists());
    }

    #[tokio::test]
    async fn test_session_cannot_be_run_twice() {
        let dir = tempdir().unwrap();
        let runner = ScriptedRunner {
            values: HashMap::new(),
            fail_on_call: Some(2),
            calls: 0,
        };
        let mut session = Session::new(settings(&dir, vec![], 3), runner).unwrap();
        assert!(session.run().await.is_err());
        assert_eq!(session.runner.calls, 2);

        let err = session.run().await.unwrap_err();
        assert!(err.to_string().contains("already been run"));
        assert!(err.downcast_ref::<ExperimentFailure>().is_none());
        assert_eq!(session.runner.calls, 2);
        assert_eq!(session.samples_collected(), 1);
        assert!(session.finalize().is_err());
    }

    #[tokio::test]
    async fn test_partial_dataset_can_be_aggregated_explicitly() {
        let dir = tempdir().unwrap();
        let runner = ScriptedRunner {
            values: HashMap::new(),
            fail_on_call: Some(3),
            calls: 0,
        };
        let mut session = Session::new(settings(&dir, vec![], 5), runner).unwrap();
        assert!(session.run().await.is_err());
        let dataset = session.into_raw_dataset().unwrap();
        assert_eq!(dataset.len(), 2);

        let aggregation = Aggregator::new(None).aggregate(&dataset);
        assert_eq!(aggregation.rows.len(), 1);
    }

    #[test]
    fn test_invalid_space_rejected_before_anything_runs() {
        let dir = tempdir().unwrap();
        let mut settings = settings(&dir, vec![StrategyFlag::WriteWithVmsplice], 1);
        settings.space = ConfigurationSpace::new(
            Configuration::baseline(4096, 1024).with_pipe_size(Some(65536)),
            vec![StrategyFlag::WriteWithVmsplice],
            vec![],
            vec![],
        );
        let runner = ScriptedRunner {
            values: HashMap::new(),
            fail_on_call: None,
            calls: 0,
        };
        let err = Session::new(settings, runner).err().unwrap();
        assert_eq!(
            err.downcast_ref::<ExperimentFailure>().map(|f| f.kind()),
            Some("configuration")
        );
        assert!(!dir.path().join("raw-data.csv").exists());
    }

    #[tokio::test]
    async fn test_zero_iterations_completes_empty() {
        let dir = tempdir().unwrap();
        let runner = ScriptedRunner {
            values: HashMap::new(),
            fail_on_call: None,
            calls: 0,
        };
        let mut session = Session::new(settings(&dir, vec![], 0), runner).unwrap();
        session.run().await.unwrap();
        let report = session.finalize().unwrap();
        assert!(report.rows.is_empty());
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[tokio::test]
    async fn test_reaggregate_matches_in_memory_aggregation() {
        let dir = tempdir().unwrap();
        let base = Configuration::baseline(4096, 1024);
        let runner = ScriptedRunner {
            values: HashMap::from([(base.clone(), vec![0.1, 0.2, 0.7])]),
            fail_on_call: None,
            calls: 0,
        };
        let mut session = Session::new(settings(&dir, vec![StrategyFlag::Gift], 3), runner).unwrap();
        session.run().await.unwrap();
        let report = session.finalize().unwrap();

        let again = reaggregate(
            &dir.path().join("raw-data.csv"),
            &dir.path().join("data-again.csv"),
            None,
        )
        .unwrap();
        assert_eq!(again.status, SessionStatus::Reaggregated);
        assert_eq!(again.rows, report.rows);
        assert_eq!(again.metadata.configurations, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("data.csv")).unwrap(),
            std::fs::read_to_string(dir.path().join("data-again.csv")).unwrap()
        );
    }

    #[test]
    fn test_settings_from_args() {
        let args = Args::parse_from([
            "pipe-bench",
            "--buf-size",
            "64K",
            "1M",
            "--always",
            "gift",
            "--toggle",
            "write_with_vmsplice",
            "gift",
        ]);
        let settings = SessionSettings::from_args(&args).unwrap();
        let space = settings.space.generate();
        assert_eq!(space.len(), 4);
        assert!(space.iter().all(|c| c.is_enabled(StrategyFlag::Gift)));
        assert_eq!(space[0].buf_size(), 64 << 10);
        assert_eq!(space[2].buf_size(), 1 << 20);
    }
}
