//! # Experiment Configuration
//!
//! A [`Configuration`] is one point in the strategy/size space under test.
//! Every representation of a configuration - the producer and consumer
//! command lines, the raw CSV columns, the aggregation key and the
//! compile-time definitions - is derived from the single field list
//! returned by [`Configuration::fields`], so the representations cannot
//! drift apart.

use crate::cli::StrategyFlag;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Name of the payload size field
pub const BYTES_TO_PIPE: &str = "bytes_to_pipe";
/// Name of the chunk size field
pub const BUF_SIZE: &str = "buf_size";
/// Name of the optional pipe capacity field
pub const PIPE_SIZE: &str = "pipe_size";

/// Names of the integer-valued fields whose values producer and consumer must agree on
pub const SIZE_FIELDS: [&str; 3] = [BYTES_TO_PIPE, BUF_SIZE, PIPE_SIZE];

/// Kind of a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Required byte count
    Integer,
    /// Byte count that may be left unset
    OptionalInteger,
    /// Strategy switch
    Flag,
}

/// Static description of one configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Value of one configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Integer(u64),
    Absent,
    Flag(bool),
}

impl FieldValue {
    /// Text used in CSV cells
    pub fn to_cell(self) -> String {
        match self {
            FieldValue::Integer(value) => value.to_string(),
            FieldValue::Absent => String::new(),
            FieldValue::Flag(true) => "1".to_string(),
            FieldValue::Flag(false) => "0".to_string(),
        }
    }

    /// Parse a CSV cell of the given kind
    pub fn from_cell(kind: FieldKind, cell: &str) -> Result<Self, String> {
        let cell = cell.trim();
        match kind {
            FieldKind::Integer => cell
                .parse()
                .map(FieldValue::Integer)
                .map_err(|_| format!("expected an integer, found '{}'", cell)),
            FieldKind::OptionalInteger if cell.is_empty() => Ok(FieldValue::Absent),
            FieldKind::OptionalInteger => cell
                .parse()
                .map(FieldValue::Integer)
                .map_err(|_| format!("expected an integer or nothing, found '{}'", cell)),
            FieldKind::Flag => match cell {
                "1" | "true" | "True" => Ok(FieldValue::Flag(true)),
                "0" | "false" | "False" => Ok(FieldValue::Flag(false)),
                _ => Err(format!("expected 0 or 1, found '{}'", cell)),
            },
        }
    }
}

/// The ordered field descriptors of a configuration
pub fn descriptors() -> Vec<FieldDescriptor> {
    let mut fields = vec![
        FieldDescriptor {
            name: BYTES_TO_PIPE,
            kind: FieldKind::Integer,
        },
        FieldDescriptor {
            name: BUF_SIZE,
            kind: FieldKind::Integer,
        },
        FieldDescriptor {
            name: PIPE_SIZE,
            kind: FieldKind::OptionalInteger,
        },
    ];
    fields.extend(StrategyFlag::ALL.iter().map(|flag| FieldDescriptor {
        name: flag.name(),
        kind: FieldKind::Flag,
    }));
    fields
}

/// Column names of a configuration, in canonical order
pub fn column_names() -> Vec<&'static str> {
    descriptors().iter().map(|d| d.name).collect()
}

/// One experiment's knobs
///
/// Configurations are never mutated once built; the `with_*` methods return
/// modified copies. Ordering and hashing follow the field values, so two
/// configurations with the same fields always share an aggregation group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Configuration {
    bytes_to_pipe: u64,
    buf_size: u64,
    pipe_size: Option<u64>,
    flags: BTreeSet<StrategyFlag>,
}

impl Configuration {
    /// A configuration with every strategy flag disabled
    pub fn baseline(bytes_to_pipe: u64, buf_size: u64) -> Self {
        Self {
            bytes_to_pipe,
            buf_size,
            pipe_size: None,
            flags: BTreeSet::new(),
        }
    }

    pub fn bytes_to_pipe(&self) -> u64 {
        self.bytes_to_pipe
    }

    pub fn buf_size(&self) -> u64 {
        self.buf_size
    }

    pub fn pipe_size(&self) -> Option<u64> {
        self.pipe_size
    }

    pub fn is_enabled(&self, flag: StrategyFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Enabled flags in canonical order
    pub fn enabled_flags(&self) -> impl Iterator<Item = StrategyFlag> + '_ {
        self.flags.iter().copied()
    }

    pub fn with_bytes_to_pipe(&self, bytes_to_pipe: u64) -> Self {
        Self {
            bytes_to_pipe,
            ..self.clone()
        }
    }

    pub fn with_buf_size(&self, buf_size: u64) -> Self {
        Self {
            buf_size,
            ..self.clone()
        }
    }

    pub fn with_pipe_size(&self, pipe_size: Option<u64>) -> Self {
        Self {
            pipe_size,
            ..self.clone()
        }
    }

    pub fn with_flag(&self, flag: StrategyFlag) -> Self {
        let mut flags = self.flags.clone();
        flags.insert(flag);
        Self {
            flags,
            ..self.clone()
        }
    }

    /// Field values in canonical column order
    pub fn fields(&self) -> Vec<(&'static str, FieldValue)> {
        let mut fields = vec![
            (BYTES_TO_PIPE, FieldValue::Integer(self.bytes_to_pipe)),
            (BUF_SIZE, FieldValue::Integer(self.buf_size)),
            (
                PIPE_SIZE,
                self.pipe_size.map_or(FieldValue::Absent, FieldValue::Integer),
            ),
        ];
        fields.extend(
            StrategyFlag::ALL
                .iter()
                .map(|flag| (flag.name(), FieldValue::Flag(self.is_enabled(*flag)))),
        );
        fields
    }

    /// Command-line arguments understood by both producer and consumer
    ///
    /// Integers are passed as `--name=value`, enabled flags as `--name`,
    /// disabled flags and an unset pipe size are omitted.
    pub fn to_args(&self) -> Vec<String> {
        self.fields()
            .into_iter()
            .filter_map(|(name, value)| match value {
                FieldValue::Integer(v) => Some(format!("--{}={}", name, v)),
                FieldValue::Flag(true) => Some(format!("--{}", name)),
                FieldValue::Flag(false) | FieldValue::Absent => None,
            })
            .collect()
    }

    /// CSV cells in canonical column order
    pub fn to_record(&self) -> Vec<String> {
        self.fields().into_iter().map(|(_, v)| v.to_cell()).collect()
    }

    /// Rebuild a configuration from CSV cells in canonical column order
    pub fn from_record<'a, I>(cells: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let descriptors = descriptors();
        let cells: Vec<&str> = cells.into_iter().collect();
        if cells.len() != descriptors.len() {
            return Err(format!(
                "expected {} configuration fields, found {}",
                descriptors.len(),
                cells.len()
            ));
        }

        let mut configuration = Configuration::baseline(0, 0);
        for (descriptor, cell) in descriptors.iter().zip(cells) {
            let value = FieldValue::from_cell(descriptor.kind, cell)
                .map_err(|e| format!("{}: {}", descriptor.name, e))?;
            configuration = match (descriptor.name, value) {
                (BYTES_TO_PIPE, FieldValue::Integer(v)) => configuration.with_bytes_to_pipe(v),
                (BUF_SIZE, FieldValue::Integer(v)) => configuration.with_buf_size(v),
                (PIPE_SIZE, FieldValue::Integer(v)) => configuration.with_pipe_size(Some(v)),
                (PIPE_SIZE, FieldValue::Absent) => configuration.with_pipe_size(None),
                (name, FieldValue::Flag(true)) => {
                    let flag = StrategyFlag::ALL
                        .iter()
                        .copied()
                        .find(|f| f.name() == name)
                        .ok_or_else(|| format!("unknown flag column '{}'", name))?;
                    configuration.with_flag(flag)
                }
                (_, FieldValue::Flag(false)) => configuration,
                (name, value) => {
                    return Err(format!("unexpected value {:?} for '{}'", value, name));
                }
            };
        }
        Ok(configuration)
    }

    /// Preprocessor definitions for binaries that bake the strategy in at compile time
    ///
    /// Every field is rendered as `-DNAME=value`; an unset pipe size renders as 0.
    pub fn compile_definitions(&self) -> String {
        self.fields()
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    FieldValue::Integer(v) => v,
                    FieldValue::Absent => 0,
                    FieldValue::Flag(b) => u64::from(b),
                };
                format!("-D{}={}", name.to_uppercase(), value)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Check the configuration for internally inconsistent settings
    pub fn validate(&self) -> Result<(), String> {
        if self.bytes_to_pipe == 0 {
            return Err("bytes_to_pipe must be greater than 0".to_string());
        }
        if self.buf_size == 0 {
            return Err("buf_size must be greater than 0".to_string());
        }
        if self.pipe_size == Some(0) {
            return Err("pipe_size must be greater than 0 when set".to_string());
        }
        if self.is_enabled(StrategyFlag::DontTouchPages)
            && self.is_enabled(StrategyFlag::CheckHugePage)
        {
            return Err(
                "dont_touch_pages and check_huge_page are incompatible: huge pages cannot be \
                 checked without faulting them in"
                    .to_string(),
            );
        }
        if self.pipe_size.is_some() && self.is_enabled(StrategyFlag::WriteWithVmsplice) {
            return Err(
                "pipe_size cannot be set together with write_with_vmsplice, the producer \
                 sizes the pipe itself"
                    .to_string(),
            );
        }
        Ok(())
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "payload={} buf={}",
            crate::utils::format_size(self.bytes_to_pipe),
            crate::utils::format_size(self.buf_size)
        )?;
        if let Some(pipe_size) = self.pipe_size {
            write!(f, " pipe={}", crate::utils::format_size(pipe_size))?;
        }
        if self.flags.is_empty() {
            write!(f, " [baseline]")
        } else {
            let names: Vec<&str> = self.flags.iter().map(|flag| flag.name()).collect();
            write!(f, " [{}]", names.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Configuration {
        Configuration::baseline(1 << 30, 1 << 17)
            .with_flag(StrategyFlag::WriteWithVmsplice)
            .with_flag(StrategyFlag::Gift)
    }

    #[test]
    fn test_fields_follow_descriptor_order() {
        let names: Vec<&str> = sample().fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, column_names());
        assert_eq!(names.len(), 3 + StrategyFlag::ALL.len());
    }

    #[test]
    fn test_to_args() {
        let args = sample().with_flag(StrategyFlag::Poll).to_args();
        assert_eq!(
            args,
            vec![
                "--bytes_to_pipe=1073741824",
                "--buf_size=131072",
                "--write_with_vmsplice",
                "--poll",
                "--gift",
            ]
        );
    }

    #[test]
    fn test_to_args_includes_pipe_size_when_set() {
        let args = Configuration::baseline(4096, 1024)
            .with_pipe_size(Some(65536))
            .to_args();
        assert_eq!(
            args,
            vec!["--bytes_to_pipe=4096", "--buf_size=1024", "--pipe_size=65536"]
        );
    }

    #[test]
    fn test_record_round_trip() {
        let original = sample().with_pipe_size(None);
        let record = original.to_record();
        assert_eq!(record[2], "");
        let parsed = Configuration::from_record(record.iter().map(String::as_str)).unwrap();
        assert_eq!(parsed, original);

        let sized = Configuration::baseline(10, 20).with_pipe_size(Some(30));
        let record = sized.to_record();
        let parsed = Configuration::from_record(record.iter().map(String::as_str)).unwrap();
        assert_eq!(parsed, sized);
    }

    #[test]
    fn test_from_record_rejects_bad_cells() {
        let mut record = sample().to_record();
        record[3] = "maybe".to_string();
        let err = Configuration::from_record(record.iter().map(String::as_str)).unwrap_err();
        assert!(err.contains("write_with_vmsplice"));

        let short = ["1", "2"];
        assert!(Configuration::from_record(short).is_err());
    }

    #[test]
    fn test_with_flag_leaves_original_untouched() {
        let base = Configuration::baseline(100, 10);
        let derived = base.with_flag(StrategyFlag::HugePage);
        assert!(!base.is_enabled(StrategyFlag::HugePage));
        assert!(derived.is_enabled(StrategyFlag::HugePage));
        assert_ne!(base, derived);
    }

    #[test]
    fn test_compile_definitions() {
        let defs = Configuration::baseline(4096, 1024)
            .with_flag(StrategyFlag::BusyLoop)
            .compile_definitions();
        assert!(defs.starts_with("-DBYTES_TO_PIPE=4096 -DBUF_SIZE=1024 -DPIPE_SIZE=0"));
        assert!(defs.contains("-DBUSY_LOOP=1"));
        assert!(defs.contains("-DHUGE_PAGE=0"));
        assert_eq!(defs.split(' ').count(), column_names().len());
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());
        assert!(Configuration::baseline(0, 1).validate().is_err());
        assert!(Configuration::baseline(1, 0).validate().is_err());
        assert!(Configuration::baseline(1, 1)
            .with_flag(StrategyFlag::DontTouchPages)
            .with_flag(StrategyFlag::CheckHugePage)
            .validate()
            .is_err());
        assert!(sample().with_pipe_size(Some(1 << 16)).validate().is_err());
        assert!(Configuration::baseline(1, 1)
            .with_pipe_size(Some(1 << 16))
            .validate()
            .is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Configuration::baseline(10 << 30, 1 << 17).to_string(),
            "payload=10GiB buf=128KiB [baseline]"
        );
        assert_eq!(
            sample().to_string(),
            "payload=1GiB buf=128KiB [write_with_vmsplice,gift]"
        );
    }
}
