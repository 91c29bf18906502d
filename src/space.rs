//! # Configuration Space
//!
//! Builds the ordered set of configurations a session measures. The
//! strategy axis is explored cumulatively: starting from the baseline, each
//! entry enables one more flag than the one before it, so consecutive rows of
//! the final table show the marginal contribution of a single strategy. The
//! size axes (payload size and chunk size) are crossed fully with that chain.

use crate::{cli::StrategyFlag, config::Configuration};
use std::collections::HashSet;

/// Definition of the configurations to test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationSpace {
    baseline: Configuration,
    toggles: Vec<StrategyFlag>,
    payload_sizes: Vec<u64>,
    buffer_sizes: Vec<u64>,
}

impl ConfigurationSpace {
    /// Create a space around `baseline`
    ///
    /// Empty size lists mean "use the baseline's value".
    pub fn new(
        baseline: Configuration,
        toggles: Vec<StrategyFlag>,
        payload_sizes: Vec<u64>,
        buffer_sizes: Vec<u64>,
    ) -> Self {
        Self {
            baseline,
            toggles,
            payload_sizes,
            buffer_sizes,
        }
    }

    pub fn baseline(&self) -> &Configuration {
        &self.baseline
    }

    pub fn toggles(&self) -> &[StrategyFlag] {
        &self.toggles
    }

    /// Generate the configurations, in presentation order and without duplicates
    pub fn generate(&self) -> Vec<Configuration> {
        let payload_sizes = axis_or(&self.payload_sizes, self.baseline.bytes_to_pipe());
        let buffer_sizes = axis_or(&self.buffer_sizes, self.baseline.buf_size());

        let mut seen = HashSet::new();
        let mut space = Vec::new();

        for &payload in &payload_sizes {
            for &buffer in &buffer_sizes {
                let mut current = self
                    .baseline
                    .with_bytes_to_pipe(payload)
                    .with_buf_size(buffer);
                if seen.insert(current.clone()) {
                    space.push(current.clone());
                }
                for &flag in &self.toggles {
                    if current.is_enabled(flag) {
                        continue;
                    }
                    current = current.with_flag(flag);
                    if seen.insert(current.clone()) {
                        space.push(current.clone());
                    }
                }
            }
        }

        space
    }
}

fn axis_or(values: &[u64], fallback: u64) -> Vec<u64> {
    if values.is_empty() {
        vec![fallback]
    } else {
        values.to_vec()
    }
}
