//! CPU discovery and pinning of child processes.
//!
//! Pinning happens in the forked child right before `exec`, so the affinity
//! mask belongs to that child alone and is applied afresh on every run. The
//! harness's own affinity is never changed.

use anyhow::{bail, Result};
use tokio::process::Command;
use tracing::debug;

/// Logical CPUs this process may run on
///
/// Falls back to `0..num_cpus` when the affinity mask cannot be read.
pub fn available_cpus() -> Vec<usize> {
    match core_affinity::get_core_ids() {
        Some(ids) if !ids.is_empty() => ids.into_iter().map(|core| core.id).collect(),
        _ => (0..num_cpus::get()).collect(),
    }
}

/// Check that producer and consumer get two distinct, usable CPUs
pub fn validate_placement(producer_cpu: usize, consumer_cpu: usize) -> Result<()> {
    if producer_cpu == consumer_cpu {
        bail!(
            "Producer and consumer must be pinned to different CPUs (both set to {})",
            producer_cpu
        );
    }

    let cpus = available_cpus();
    for (role, cpu) in [("producer", producer_cpu), ("consumer", consumer_cpu)] {
        if !cpus.contains(&cpu) {
            bail!(
                "CPU {} requested for the {} is not available (usable CPUs: {:?})",
                cpu,
                role,
                cpus
            );
        }
    }
    Ok(())
}

/// Arrange for the spawned child to run only on `cpu`
#[cfg(target_os = "linux")]
pub fn pin_to_cpu(command: &mut Command, cpu: usize) -> std::io::Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set.set(cpu).map_err(std::io::Error::from)?;

    debug!("Pinning child to CPU {}", cpu);
    // SAFETY: the closure only calls sched_setaffinity on a stack copy of the
    // mask, which is async-signal-safe and does not allocate.
    unsafe {
        command.pre_exec(move || {
            sched_setaffinity(Pid::from_raw(0), &cpu_set).map_err(std::io::Error::from)
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_to_cpu(_command: &mut Command, cpu: usize) -> std::io::Result<()> {
    tracing::warn!("CPU pinning is only supported on Linux; not pinning to CPU {}", cpu);
    Ok(())
}
