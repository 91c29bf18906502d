//! # Experiment Runner
//!
//! Executes one configuration as a producer/consumer process pair and turns
//! the consumer's report into samples.
//!
//! ## Protocol
//!
//! 1. Both command lines are derived from the same configuration; per-side
//!    extra arguments are appended afterwards, so the size arguments of both
//!    sides are compared before anything is spawned.
//! 2. If a build command is configured it is run with the configuration's
//!    compile-time definitions in the environment.
//! 3. An OS pipe is created. The producer is spawned with the write end as
//!    its stdout, then the consumer with the read end as its stdin. The
//!    harness drops its copies of both ends right after each spawn; it never
//!    reads or writes through the pipe itself.
//! 4. Each child is pinned to its own CPU between `fork` and `exec`.
//! 5. The harness waits for the consumer (optionally bounded by a timeout),
//!    captures its stdout, then reaps the producer.
//!
//! ```text
//!  ┌──────────┐  stdout   ┌──────┐   stdin  ┌──────────┐  stdout  ┌─────────┐
//!  │ producer │──────────►│ pipe │─────────►│ consumer │─────────►│ harness │
//!  │  CPU p   │           └──────┘          │  CPU c   │          └─────────┘
//!  └──────────┘                             └──────────┘
//! ```

use crate::{
    affinity::pin_to_cpu,
    cli::{parse_size, Args, ThroughputUnit},
    config::{descriptors, Configuration, FieldValue, SIZE_FIELDS},
    error::{ExperimentFailure, Role},
    results::Sample,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Executes configurations and reports their samples
///
/// The session only talks to this trait, so alternative executors (and test
/// doubles) can be plugged in.
#[async_trait]
pub trait ExperimentRunner: Send {
    /// Measure one configuration
    ///
    /// Returns one sample per measurement line the consumer printed.
    async fn run(&mut self, configuration: &Configuration)
        -> Result<Vec<Sample>, ExperimentFailure>;
}

/// Shell command that rebuilds the binaries for each configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildStep {
    /// Command line passed to `sh -c`
    pub command: String,
    /// Environment variable receiving the `-D` definitions
    pub env_var: String,
}

/// Settings of a [`PipeRunner`]
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub producer: PathBuf,
    pub consumer: PathBuf,
    pub producer_cpu: usize,
    pub consumer_cpu: usize,
    pub producer_args: Vec<String>,
    pub consumer_args: Vec<String>,
    pub unit: ThroughputUnit,
    pub timeout: Option<Duration>,
    pub build: Option<BuildStep>,
    pub show_child_stderr: bool,
    /// How long the producer may linger after the consumer has exited
    pub producer_grace: Duration,
}

impl RunnerConfig {
    /// Build runner settings from the command line
    pub fn from_args(args: &Args) -> Self {
        Self {
            producer: args.producer.clone(),
            consumer: args.consumer.clone(),
            producer_cpu: args.producer_cpu,
            consumer_cpu: args.consumer_cpu,
            producer_args: args.producer_arg.clone(),
            consumer_args: args.consumer_arg.clone(),
            unit: args.consumer_unit,
            timeout: args.timeout,
            build: args.build_command.as_ref().map(|command| BuildStep {
                command: command.clone(),
                env_var: args.build_env_var.clone(),
            }),
            show_child_stderr: args.show_child_stderr,
            producer_grace: crate::defaults::PRODUCER_GRACE,
        }
    }
}

/// One side of the process pair, fully resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub role: Role,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cpu: usize,
}

impl Invocation {
    /// Value of a `--name=value` / `--name value` argument; the last occurrence wins.
    /// Sizes are normalised to plain byte counts.
    pub fn size_argument(&self, name: &str) -> Option<String> {
        let flag = format!("--{}", name);
        let mut value = None;
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if *arg == flag {
                value = args.next().map(String::as_str);
            } else if let Some(v) = arg.strip_prefix(flag.as_str()).and_then(|r| r.strip_prefix('=')) {
                value = Some(v);
            }
        }
        value.map(|v| parse_size(v).map_or_else(|_| v.to_string(), |n| n.to_string()))
    }
}

/// Check that producer and consumer agree on every size argument
pub fn check_symmetry(producer: &Invocation, consumer: &Invocation) -> Result<(), String> {
    for field in SIZE_FIELDS {
        let produced = producer.size_argument(field);
        let consumed = consumer.size_argument(field);
        if produced != consumed {
            return Err(format!(
                "producer and consumer disagree on {}: {} vs {}",
                field,
                produced.as_deref().unwrap_or("unset"),
                consumed.as_deref().unwrap_or("unset")
            ));
        }
    }
    Ok(())
}

/// Runs each configuration as a pinned producer/consumer pair joined by a pipe
pub struct PipeRunner {
    config: RunnerConfig,
}

impl PipeRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Resolve both command lines for a configuration
    pub fn invocations(&self, configuration: &Configuration) -> (Invocation, Invocation) {
        let shared = configuration.to_args();
        let side = |role, program: &PathBuf, extra: &[String], cpu| {
            let mut args = shared.clone();
            args.extend(extra.iter().cloned());
            Invocation {
                role,
                program: program.clone(),
                args,
                cpu,
            }
        };
        (
            side(
                Role::Producer,
                &self.config.producer,
                &self.config.producer_args,
                self.config.producer_cpu,
            ),
            side(
                Role::Consumer,
                &self.config.consumer,
                &self.config.consumer_args,
                self.config.consumer_cpu,
            ),
        )
    }

    fn command(&self, invocation: &Invocation) -> Result<Command, ExperimentFailure> {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args).kill_on_drop(true);
        pin_to_cpu(&mut command, invocation.cpu).map_err(|source| ExperimentFailure::Launch {
            role: invocation.role,
            program: invocation.program.clone(),
            source,
        })?;
        Ok(command)
    }

    fn child_stderr(&self) -> Stdio {
        if self.config.show_child_stderr {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    }

    async fn rebuild(
        &self,
        build: &BuildStep,
        configuration: &Configuration,
    ) -> Result<(), ExperimentFailure> {
        let definitions = configuration.compile_definitions();
        debug!("Rebuilding with {}=\"{}\"", build.env_var, definitions);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&build.command)
            .env(&build.env_var, &definitions)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExperimentFailure::Build {
                configuration: Box::new(configuration.clone()),
                reason: format!("could not start '{}': {}", build.command, e),
            })?;

        if !output.status.success() {
            return Err(ExperimentFailure::Build {
                configuration: Box::new(configuration.clone()),
                reason: format!(
                    "'{}' {}: {}",
                    build.command,
                    describe_status(output.status),
                    stderr_tail(&output.stderr)
                ),
            });
        }
        Ok(())
    }

    /// Spawn the pair, wait for the consumer and return its stdout
    async fn execute(
        &self,
        configuration: &Configuration,
        producer: &Invocation,
        consumer: &Invocation,
    ) -> Result<String, ExperimentFailure> {
        let (reader, writer) = os_pipe::pipe().map_err(|source| ExperimentFailure::Launch {
            role: Role::Producer,
            program: producer.program.clone(),
            source,
        })?;

        debug!("Spawning producer: {} {:?}", producer.program.display(), producer.args);
        let mut producer_child = {
            let mut command = self.command(producer)?;
            command
                .stdin(Stdio::null())
                .stdout(writer)
                .stderr(self.child_stderr());
            command.spawn().map_err(|source| ExperimentFailure::Launch {
                role: Role::Producer,
                program: producer.program.clone(),
                source,
            })?
            // The command, and with it our copy of the write end, is dropped here.
        };

        debug!("Spawning consumer: {} {:?}", consumer.program.display(), consumer.args);
        let consumer_child = {
            let mut command = self.command(consumer)?;
            command
                .stdin(reader)
                .stdout(Stdio::piped())
                .stderr(if self.config.show_child_stderr {
                    Stdio::inherit()
                } else {
                    Stdio::piped()
                });
            command.spawn().map_err(|source| ExperimentFailure::Launch {
                role: Role::Consumer,
                program: consumer.program.clone(),
                source,
            })?
        };

        let waited = match self.config.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, consumer_child.wait_with_output()).await {
                    Ok(waited) => waited,
                    Err(_) => {
                        // The consumer was owned by the dropped future and is killed on drop.
                        kill(&mut producer_child).await;
                        return Err(ExperimentFailure::Timeout {
                            configuration: Box::new(configuration.clone()),
                            after: limit,
                        });
                    }
                }
            }
            None => consumer_child.wait_with_output().await,
        };

        let output = match waited {
            Ok(output) => output,
            Err(e) => {
                kill(&mut producer_child).await;
                return Err(ExperimentFailure::Runtime {
                    configuration: Box::new(configuration.clone()),
                    role: Role::Consumer,
                    status: format!("wait failed: {}", e),
                    stderr: String::new(),
                });
            }
        };

        if !output.status.success() {
            let producer_note = match producer_child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    format!("; producer {}", describe_status(status))
                }
                _ => String::new(),
            };
            self.reap_producer(&mut producer_child).await;
            return Err(ExperimentFailure::Runtime {
                configuration: Box::new(configuration.clone()),
                role: Role::Consumer,
                status: format!("{}{}", describe_status(output.status), producer_note),
                stderr: stderr_tail(&output.stderr),
            });
        }

        self.reap_producer(&mut producer_child).await;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Wait for the producer to notice the closed pipe, killing it after the grace period
    async fn reap_producer(&self, producer: &mut Child) {
        match tokio::time::timeout(self.config.producer_grace, producer.wait()).await {
            Ok(Ok(status)) if is_expected_producer_exit(status) => {
                debug!("Producer {}", describe_status(status))
            }
            Ok(Ok(status)) => warn!(
                "Producer {} although the consumer succeeded; its sample may be unreliable",
                describe_status(status)
            ),
            Ok(Err(e)) => warn!("Failed to wait for producer: {}", e),
            Err(_) => {
                warn!(
                    "Producer still running {:?} after the consumer exited; killing it",
                    self.config.producer_grace
                );
                kill(producer).await;
            }
        }
    }
}

#[async_trait]
impl ExperimentRunner for PipeRunner {
    async fn run(
        &mut self,
        configuration: &Configuration,
    ) -> Result<Vec<Sample>, ExperimentFailure> {
        let configuration_error = |reason: String| ExperimentFailure::Configuration {
            configuration: Box::new(configuration.clone()),
            reason,
        };

        configuration.validate().map_err(configuration_error)?;
        let (producer, consumer) = self.invocations(configuration);
        check_symmetry(&producer, &consumer).map_err(configuration_error)?;

        if let Some(build) = &self.config.build {
            self.rebuild(build, configuration).await?;
        }

        let stdout = self.execute(configuration, &producer, &consumer).await?;
        parse_consumer_output(configuration, &stdout, self.config.unit)
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Kill failed (process probably already exited): {}", e);
    }
}

/// Human-readable exit status, naming SIGPIPE explicitly
fn describe_status(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGPIPE) {
            return "terminated by SIGPIPE".to_string();
        }
    }
    status.to_string()
}

/// Success, or death by SIGPIPE once the consumer closed the read end
fn is_expected_producer_exit(status: ExitStatus) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if status.signal() == Some(libc::SIGPIPE) {
            return true;
        }
    }
    status.success()
}

/// Last few lines of a child's stderr
fn stderr_tail(stderr: &[u8]) -> String {
    const MAX_LINES: usize = 5;
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    lines[lines.len().saturating_sub(MAX_LINES)..].join(" | ")
}

/// Turn the consumer's stdout into samples
///
/// Every non-empty line is one measurement, in one of these forms:
///
/// - `<value>`
/// - `<case>,<value>` where `<case>` is not a number
/// - `<value>,<field>,...` echoing every configuration column; the echoed
///   fields must match the configuration that was run
///
/// An unnamed measurement must be the only line. Values are converted from
/// `unit` to bytes per second.
pub fn parse_consumer_output(
    configuration: &Configuration,
    stdout: &str,
    unit: ThroughputUnit,
) -> Result<Vec<Sample>, ExperimentFailure> {
    let parse_error = |reason: String| ExperimentFailure::Parse {
        configuration: Box::new(configuration.clone()),
        reason,
        output: stdout.to_string(),
    };

    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return Err(parse_error("consumer printed no throughput line".to_string()));
    }

    let mut samples = Vec::with_capacity(lines.len());
    let mut cases = HashSet::new();
    for line in &lines {
        let (case, value) = parse_line(configuration, line).map_err(&parse_error)?;
        match &case {
            None if lines.len() > 1 => {
                return Err(parse_error(format!(
                    "unnamed measurement '{}' among {} lines",
                    line,
                    lines.len()
                )));
            }
            Some(name) if !cases.insert(name.clone()) => {
                return Err(parse_error(format!("case '{}' reported twice", name)));
            }
            _ => {}
        }
        samples.push(Sample::new(
            configuration.clone(),
            case,
            unit.to_bytes_per_second(value),
        ));
    }
    Ok(samples)
}

fn parse_line(configuration: &Configuration, line: &str) -> Result<(Option<String>, f64), String> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    match fields.as_slice() {
        [value] => Ok((None, parse_value(value)?)),
        [name, value] if name.parse::<f64>().is_err() => {
            if name.is_empty() {
                return Err(format!("empty case name in '{}'", line));
            }
            Ok((Some((*name).to_string()), parse_value(value)?))
        }
        [value, echoed @ ..] => {
            check_echo(configuration, echoed)?;
            Ok((None, parse_value(value)?))
        }
        [] => Err("empty line".to_string()),
    }
}

fn parse_value(value: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a decimal throughput", value))?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(format!("throughput {} is not a finite non-negative number", value));
    }
    Ok(parsed)
}

fn check_echo(configuration: &Configuration, echoed: &[&str]) -> Result<(), String> {
    let descriptors = descriptors();
    if echoed.len() != descriptors.len() {
        return Err(format!(
            "expected {} echoed configuration fields after the throughput, found {}",
            descriptors.len(),
            echoed.len()
        ));
    }
    for ((descriptor, cell), (_, expected)) in descriptors
        .iter()
        .zip(echoed)
        .zip(configuration.fields())
    {
        let reported = FieldValue::from_cell(descriptor.kind, cell)
            .map_err(|e| format!("echoed {}: {}", descriptor.name, e))?;
        if reported != expected {
            return Err(format!(
                "consumer ran with {}={} but {} was requested",
                descriptor.name,
                cell,
                expected.to_cell()
            ));
        }
    }
    Ok(())
}
