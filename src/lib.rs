//! # Pipe Transfer Benchmark Library
//!
//! Measures how fast a producer process can push a fixed payload through an
//! anonymous pipe to a consumer process, across a space of transfer
//! strategies (vmsplice, splice, huge pages, busy looping and friends).
//!
//! ## Architecture Overview
//!
//! - `config`: one point in the strategy space and its serialized forms
//! - `space`: cumulative generation of the configurations to measure
//! - `schedule`: randomized execution order across iterations
//! - `runner`: launching the producer/consumer pair and parsing its output
//! - `results`: the durable raw dataset and the session report
//! - `aggregate`: per-configuration means and data-quality warnings
//! - `session`: the init/run/finalize lifecycle tying it all together
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pipe_bench::{
//!     ConfigurationSpace, Configuration, PipeRunner, RunnerConfig, Session, SessionSettings,
//!     StrategyFlag,
//! };
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = pipe_bench::Args::parse_from(["pipe-bench"]);
//!     let mut settings = SessionSettings::from_args(&args)?;
//!     settings.space = ConfigurationSpace::new(
//!         Configuration::baseline(1 << 30, 1 << 17),
//!         vec![StrategyFlag::WriteWithVmsplice, StrategyFlag::ReadWithSplice],
//!         vec![],
//!         vec![],
//!     );
//!
//!     let runner = PipeRunner::new(RunnerConfig::from_args(&args));
//!     let mut session = Session::new(settings, runner)?;
//!     session.run().await?;
//!     let report = session.finalize()?;
//!     println!("{} aggregated rows", report.rows.len());
//!     Ok(())
//! }
//! ```

/// CPU placement of the producer and consumer processes
pub mod affinity;

/// Grouping of raw samples into per-configuration means
pub mod aggregate;

/// Command-line interface
///
/// Size arguments accept binary suffixes (`32K`, `8M`, `10G`) and strategy
/// flags are named exactly as the child programs expect them.
pub mod cli;

pub mod config;

/// Typed failures of a single experiment run
pub mod error;

pub mod logging;

/// Raw dataset persistence and the JSON session report
pub mod results;

/// Process-pair execution of one configuration
pub mod runner;

pub mod schedule;

/// Measurement session lifecycle
pub mod session;

pub mod space;

pub mod utils;

pub use aggregate::{AggregatedRow, Aggregation, AggregationWarning, Aggregator, GroupSummary};
pub use cli::{Args, StrategyFlag, ThroughputUnit};
pub use config::Configuration;
pub use error::{ExperimentFailure, Role};
pub use results::{RawDataset, ResultCollector, Sample, SessionReport};
pub use runner::{ExperimentRunner, PipeRunner, RunnerConfig};
pub use schedule::{ExperimentSchedule, ScheduledRun};
pub use session::{Session, SessionSettings};
pub use space::ConfigurationSpace;

/// The current version of the pipe benchmark
///
/// Recorded in every session report for reproducibility.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use crate::cli::StrategyFlag;
    use std::time::Duration;

    /// Producer program, relative to the working directory
    pub const PRODUCER: &str = "./write";

    /// Consumer program, relative to the working directory
    pub const CONSUMER: &str = "./read";

    /// Measurements per configuration
    pub const ITERATIONS: usize = 10;

    /// Strategies enabled cumulatively on top of the baseline
    pub const TOGGLES: [StrategyFlag; 4] = [
        StrategyFlag::WriteWithVmsplice,
        StrategyFlag::ReadWithSplice,
        StrategyFlag::HugePage,
        StrategyFlag::BusyLoop,
    ];

    pub const PRODUCER_CPU: usize = 0;
    pub const CONSUMER_CPU: usize = 1;

    /// Environment variable carrying `-D` definitions to the build command
    pub const BUILD_ENV_VAR: &str = "OPTIONS_CFLAGS";

    pub const RAW_OUTPUT_FILE: &str = "raw-data.csv";
    pub const AGGREGATED_OUTPUT_FILE: &str = "data.csv";

    /// Time the producer gets to exit on its own once the consumer is done
    ///
    /// Producers usually stream forever and die of SIGPIPE as soon as the
    /// read end closes; anything still alive after this is killed.
    pub const PRODUCER_GRACE: Duration = Duration::from_secs(2);

    /// Unit of every throughput value stored by the harness
    pub const THROUGHPUT_UNIT: &str = "bytes_per_second";
}
