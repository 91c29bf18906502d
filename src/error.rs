//! Failure taxonomy of a single experiment run.
//!
//! Every variant carries the configuration that was being measured so the
//! operator can tell which point of the space broke the session.

use crate::config::Configuration;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Which side of the process pair a failure refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Consumer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

/// Why a run did not produce samples
///
/// None of these are retried: any of them aborts the session, leaving the
/// samples persisted so far intact.
#[derive(Debug, Error)]
pub enum ExperimentFailure {
    /// The configuration, or the command lines derived from it, is inconsistent.
    /// Raised before any process is spawned.
    #[error("invalid configuration {configuration}: {reason}")]
    Configuration {
        configuration: Box<Configuration>,
        reason: String,
    },

    /// A binary could not be started at all (missing, not executable, ...).
    #[error("failed to launch {role} {}: {source}", .program.display())]
    Launch {
        role: Role,
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The compile-time build step failed for this configuration.
    #[error("build command failed for {configuration}: {reason}")]
    Build {
        configuration: Box<Configuration>,
        reason: String,
    },

    /// A process started but exited unsuccessfully.
    #[error("{role} failed for {configuration} ({status}){}", format_stderr(.stderr))]
    Runtime {
        configuration: Box<Configuration>,
        role: Role,
        status: String,
        stderr: String,
    },

    /// The consumer's output is not a throughput report.
    #[error("could not parse consumer output for {configuration}: {reason}")]
    Parse {
        configuration: Box<Configuration>,
        reason: String,
        output: String,
    },

    /// The consumer did not finish within the configured bound.
    #[error("run for {configuration} did not finish within {after:?}; both processes killed")]
    Timeout {
        configuration: Box<Configuration>,
        after: Duration,
    },
}

impl ExperimentFailure {
    /// Configuration the failure refers to, when known
    pub fn configuration(&self) -> Option<&Configuration> {
        match self {
            ExperimentFailure::Configuration { configuration, .. }
            | ExperimentFailure::Build { configuration, .. }
            | ExperimentFailure::Runtime { configuration, .. }
            | ExperimentFailure::Parse { configuration, .. }
            | ExperimentFailure::Timeout { configuration, .. } => Some(&**configuration),
            ExperimentFailure::Launch { .. } => None,
        }
    }

    /// Short name of the failure class, used in logs and the session report
    pub fn kind(&self) -> &'static str {
        match self {
            ExperimentFailure::Configuration { .. } => "configuration",
            ExperimentFailure::Launch { .. } => "launch",
            ExperimentFailure::Build { .. } => "build",
            ExperimentFailure::Runtime { .. } => "runtime",
            ExperimentFailure::Parse { .. } => "parse",
            ExperimentFailure::Timeout { .. } => "timeout",
        }
    }
}

fn format_stderr(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}
