use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Pipe Benchmark Harness - measures producer/consumer throughput across transfer strategies
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Producer executable (writes the payload to its standard output)
    #[clap(long, default_value = crate::defaults::PRODUCER, help_heading = "Core Options")]
    pub producer: PathBuf,

    /// Consumer executable (reads the payload from its standard input)
    #[clap(long, default_value = crate::defaults::CONSUMER, help_heading = "Core Options")]
    pub consumer: PathBuf,

    /// Number of times the full configuration space is replayed
    #[clap(short = 'i', long, default_value_t = crate::defaults::ITERATIONS)]
    pub iterations: usize,

    /// Payload sizes to transfer per run (e.g. 10G, 512M)
    #[clap(long, value_parser = parse_size, num_args = 1.., default_values = ["10G"])]
    pub bytes_to_pipe: Vec<u64>,

    /// Transfer chunk sizes to test (e.g. 32K 128K 1M 8M)
    #[clap(long, value_parser = parse_size, num_args = 1.., default_values = ["32K", "128K", "1M", "8M"])]
    pub buf_size: Vec<u64>,

    /// Pipe capacity override passed to both sides
    #[clap(long, value_parser = parse_size)]
    pub pipe_size: Option<u64>,

    /// Strategy flags enabled one after another on top of the baseline
    #[clap(long, value_enum, num_args = 1.., default_values_t = crate::defaults::TOGGLES.to_vec(), help_heading = "Strategy Options")]
    pub toggle: Vec<StrategyFlag>,

    /// Strategy flags enabled in every configuration, baseline included
    #[clap(long, value_enum, num_args = 1.., help_heading = "Strategy Options")]
    pub always: Vec<StrategyFlag>,

    /// Logical CPU the producer is pinned to
    #[clap(long, default_value_t = crate::defaults::PRODUCER_CPU, help_heading = "Placement Options")]
    pub producer_cpu: usize,

    /// Logical CPU the consumer is pinned to
    #[clap(long, default_value_t = crate::defaults::CONSUMER_CPU, help_heading = "Placement Options")]
    pub consumer_cpu: usize,

    /// Seed for the per-iteration shuffle (fresh seed when omitted)
    #[clap(long)]
    pub seed: Option<u64>,

    /// Abort a run whose consumer has not exited after this long (e.g. 90s, 5m)
    #[clap(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Unit of the throughput values printed by the consumer
    #[clap(long, value_enum, default_value_t = ThroughputUnit::BytesPerSecond)]
    pub consumer_unit: ThroughputUnit,

    /// Extra argument appended to the producer command line (repeatable)
    #[clap(long, allow_hyphen_values = true)]
    pub producer_arg: Vec<String>,

    /// Extra argument appended to the consumer command line (repeatable)
    #[clap(long, allow_hyphen_values = true)]
    pub consumer_arg: Vec<String>,

    /// Shell command rebuilding the binaries before every run
    #[clap(long, help_heading = "Build Options")]
    pub build_command: Option<String>,

    /// Environment variable receiving the -D definitions for the build command
    #[clap(long, default_value = crate::defaults::BUILD_ENV_VAR, help_heading = "Build Options")]
    pub build_env_var: String,

    /// Raw per-run samples (CSV, one file per session)
    #[clap(long, default_value = crate::defaults::RAW_OUTPUT_FILE, help_heading = "Output Options")]
    pub raw_output: PathBuf,

    /// Mean throughput per configuration (CSV)
    #[clap(long, default_value = crate::defaults::AGGREGATED_OUTPUT_FILE, help_heading = "Output Options")]
    pub aggregated_output: PathBuf,

    /// Session report with metadata and per-configuration statistics (JSON)
    #[clap(long, help_heading = "Output Options")]
    pub summary_output: Option<PathBuf>,

    /// Skip running and aggregate an existing raw dataset
    #[clap(long, value_name = "RAW_CSV", help_heading = "Output Options")]
    pub aggregate_only: Option<PathBuf>,

    /// Print the configuration space and exit
    #[clap(long, default_value_t = false)]
    pub list: bool,

    /// Let producer and consumer write to the harness's standard error
    #[clap(long, default_value_t = false)]
    pub show_child_stderr: bool,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

/// Transfer strategy switches understood by the producer and consumer binaries
///
/// The declaration order is the canonical column order used for command lines,
/// CSV headers and aggregation keys.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StrategyFlag {
    /// Producer hands pages to the pipe with vmsplice
    #[clap(name = "write_with_vmsplice")]
    WriteWithVmsplice,

    /// Consumer drains the pipe with splice
    #[clap(name = "read_with_splice")]
    ReadWithSplice,

    /// Back the transfer buffer with huge pages
    #[clap(name = "huge_page")]
    HugePage,

    /// Spin on EAGAIN instead of blocking
    #[clap(name = "busy_loop")]
    BusyLoop,

    /// Wait for readiness with poll
    #[clap(name = "poll")]
    Poll,

    /// Transfer page ownership (SPLICE_F_GIFT / SPLICE_F_MOVE)
    #[clap(name = "gift")]
    Gift,

    /// Lock the buffer in memory
    #[clap(name = "lock_memory")]
    LockMemory,

    /// Reuse one buffer for every chunk
    #[clap(name = "same_buffer")]
    SameBuffer,

    /// Do not fault the buffer in before transferring
    #[clap(name = "dont_touch_pages")]
    DontTouchPages,

    /// Verify that the buffer really is huge-page backed
    #[clap(name = "check_huge_page")]
    CheckHugePage,
}

impl StrategyFlag {
    /// Every flag, in canonical column order
    pub const ALL: [StrategyFlag; 10] = [
        StrategyFlag::WriteWithVmsplice,
        StrategyFlag::ReadWithSplice,
        StrategyFlag::HugePage,
        StrategyFlag::BusyLoop,
        StrategyFlag::Poll,
        StrategyFlag::Gift,
        StrategyFlag::LockMemory,
        StrategyFlag::SameBuffer,
        StrategyFlag::DontTouchPages,
        StrategyFlag::CheckHugePage,
    ];

    /// Field name shared by the command line, CSV header and build definitions
    pub fn name(self) -> &'static str {
        match self {
            StrategyFlag::WriteWithVmsplice => "write_with_vmsplice",
            StrategyFlag::ReadWithSplice => "read_with_splice",
            StrategyFlag::HugePage => "huge_page",
            StrategyFlag::BusyLoop => "busy_loop",
            StrategyFlag::Poll => "poll",
            StrategyFlag::Gift => "gift",
            StrategyFlag::LockMemory => "lock_memory",
            StrategyFlag::SameBuffer => "same_buffer",
            StrategyFlag::DontTouchPages => "dont_touch_pages",
            StrategyFlag::CheckHugePage => "check_huge_page",
        }
    }
}

impl std::fmt::Display for StrategyFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Unit of the numbers a consumer prints
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum ThroughputUnit {
    /// Plain bytes per second
    #[clap(name = "bytes-per-second")]
    BytesPerSecond,

    /// Decimal gigabytes (1e9 bytes) per second
    #[clap(name = "gigabytes-per-second")]
    GigabytesPerSecond,
}

impl ThroughputUnit {
    /// Convert a value printed in this unit to bytes per second
    pub fn to_bytes_per_second(self, value: f64) -> f64 {
        match self {
            ThroughputUnit::BytesPerSecond => value,
            ThroughputUnit::GigabytesPerSecond => value * 1e9,
        }
    }
}

/// Parse a byte count with an optional binary suffix (e.g. "4096", "128K", "8M", "10G")
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }

    let (num_str, shift) = match s.as_bytes()[s.len() - 1] {
        b'K' | b'k' => (&s[..s.len() - 1], 10),
        b'M' | b'm' => (&s[..s.len() - 1], 20),
        b'G' | b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| format!("Invalid size specification: {}", s))?;

    num.checked_mul(1u64 << shift)
        .ok_or_else(|| format!("Size does not fit in 64 bits: {}", s))
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a finite, non-negative number: {}", s));
    }

    let seconds = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Duration::try_from_secs_f64(seconds).map_err(|_| format!("Duration out of range: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("inf").is_err());
        assert!(parse_duration("NaNm").is_err());
        assert!(parse_duration("1e300h").is_err());
    }

    #[test]
    fn test_bad_timeout_is_a_usage_error() {
        assert!(Args::try_parse_from(["pipe-bench", "--timeout=inf"]).is_err());
        assert!(Args::try_parse_from(["pipe-bench", "--timeout=-1s"]).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("32K").unwrap(), 1 << 15);
        assert_eq!(parse_size("128k").unwrap(), 1 << 17);
        assert_eq!(parse_size("8M").unwrap(), 1 << 23);
        assert_eq!(parse_size("10G").unwrap(), 10 << 30);

        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("99999999999G").is_err());
    }

    #[test]
    fn test_strategy_flag_names_match_value_enum() {
        for flag in StrategyFlag::ALL {
            let value = flag.to_possible_value().unwrap();
            assert_eq!(value.get_name(), flag.name());
            assert_eq!(flag.to_string(), flag.name());
        }
    }

    #[test]
    fn test_strategy_flag_order_is_declaration_order() {
        let mut sorted = StrategyFlag::ALL;
        sorted.sort();
        assert_eq!(sorted, StrategyFlag::ALL);
    }

    #[test]
    fn test_throughput_unit_conversion() {
        assert_eq!(ThroughputUnit::BytesPerSecond.to_bytes_per_second(42.0), 42.0);
        assert_eq!(
            ThroughputUnit::GigabytesPerSecond.to_bytes_per_second(2.5),
            2.5e9
        );
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["pipe-bench"]);
        assert_eq!(args.iterations, crate::defaults::ITERATIONS);
        assert_eq!(args.buf_size, vec![1 << 15, 1 << 17, 1 << 20, 1 << 23]);
        assert_eq!(args.bytes_to_pipe, vec![10 << 30]);
        assert_eq!(args.toggle, crate::defaults::TOGGLES.to_vec());
        assert!(args.always.is_empty());
        assert_eq!(args.producer_cpu, 0);
        assert_eq!(args.consumer_cpu, 1);
        assert!(args.timeout.is_none());
    }

    #[test]
    fn test_args_accept_hyphenated_child_arguments() {
        let args = Args::parse_from([
            "pipe-bench",
            "--producer-arg",
            "--verbose",
            "--toggle",
            "gift",
            "poll",
        ]);
        assert_eq!(args.producer_arg, vec!["--verbose".to_string()]);
        assert_eq!(args.toggle, vec![StrategyFlag::Gift, StrategyFlag::Poll]);
    }
}
