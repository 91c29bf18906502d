//! # Experiment Schedule
//!
//! Replays the configuration space for a number of iterations. Each
//! iteration visits every configuration exactly once, in an order drawn
//! independently from a seeded RNG so that slow drifts (thermal throttling,
//! cache and page-cache warm-up) cannot line up with one configuration.
//! Passing the same seed reproduces the same order.

use crate::config::Configuration;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

/// One scheduled run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRun<'a> {
    /// Zero-based iteration number
    pub iteration: usize,
    /// Zero-based position inside the iteration
    pub position: usize,
    pub configuration: &'a Configuration,
}

/// Lazy, randomized sequence of `|space| * iterations` runs
///
/// The schedule is not resumable: restarting means constructing a new one.
pub struct ExperimentSchedule<'a> {
    space: &'a [Configuration],
    iterations: usize,
    seed: u64,
    rng: StdRng,
    order: Vec<usize>,
    iteration: usize,
    position: usize,
}

impl<'a> ExperimentSchedule<'a> {
    /// Create a schedule; without a seed a fresh one is drawn from the OS
    pub fn new(space: &'a [Configuration], iterations: usize, seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random);
        Self {
            space,
            iterations,
            seed,
            rng: StdRng::seed_from_u64(seed),
            order: Vec::new(),
            iteration: 0,
            position: 0,
        }
    }

    /// Seed actually used for shuffling
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Total number of runs, including those already yielded
    pub fn total_runs(&self) -> usize {
        self.space.len() * self.iterations
    }

    fn remaining(&self) -> usize {
        if self.iteration >= self.iterations {
            return 0;
        }
        let consumed = self.iteration * self.space.len() + self.position;
        self.total_runs() - consumed
    }
}

impl<'a> Iterator for ExperimentSchedule<'a> {
    type Item = ScheduledRun<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.space.is_empty() || self.iteration >= self.iterations {
            return None;
        }

        if self.position == 0 {
            self.order = (0..self.space.len()).collect();
            self.order.shuffle(&mut self.rng);
        }

        let run = ScheduledRun {
            iteration: self.iteration,
            position: self.position,
            configuration: &self.space[self.order[self.position]],
        };

        self.position += 1;
        if self.position == self.space.len() {
            self.position = 0;
            self.iteration += 1;
        }

        Some(run)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<'a> ExactSizeIterator for ExperimentSchedule<'a> {}
