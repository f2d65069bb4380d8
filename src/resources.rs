use std::env;

use log::info;
use sysinfo::System;

/// Fraction of the detected memory that is actually handed to an external
/// tool. The remainder absorbs allocator overhead and the tool's own
/// bookkeeping so the scheduler does not kill the process.
const MEMORY_SAFETY_MARGIN: f64 = 0.9;

/// A point-in-time description of the execution environment.
///
/// Capturing the environment is separated from deciding a budget so the
/// decision policy stays a pure function of this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    pub cpu_count: usize,
    /// Cluster-provided per-CPU memory hint, in megabytes.
    pub mem_per_cpu_mb: Option<u64>,
    /// Cluster-provided per-node memory hint, in megabytes.
    pub mem_per_node_mb: Option<u64>,
    /// Memory currently available on the host, in megabytes.
    pub host_available_mb: u64,
}

impl EnvironmentSnapshot {
    /// Reads the current process environment and host state.
    ///
    /// The cluster hints follow the SLURM convention (`SLURM_MEM_PER_CPU`,
    /// `SLURM_MEM_PER_NODE`, both in MB); unparsable values are treated as
    /// absent rather than fatal.
    pub fn capture() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let host_available_mb = sys.available_memory() / (1024 * 1024);

        Self {
            cpu_count: num_cpus::get(),
            mem_per_cpu_mb: env_mb("SLURM_MEM_PER_CPU"),
            mem_per_node_mb: env_mb("SLURM_MEM_PER_NODE"),
            host_available_mb,
        }
    }
}

fn env_mb(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Thread count and memory ceiling for one external tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceBudget {
    pub threads: usize,
    pub memory_mb: u64,
}

/// Derives a budget from a snapshot.
///
/// Priority order for the memory source: per-CPU hint scaled by the CPU
/// count, then the per-node hint, then host available memory. Every source
/// is scaled by the safety margin. This never fails; with no hints at all it
/// degrades to the most conservative information available (the host).
pub fn negotiate(snapshot: &EnvironmentSnapshot, thread_override: Option<usize>) -> ResourceBudget {
    let raw_mb = if let Some(per_cpu) = snapshot.mem_per_cpu_mb {
        per_cpu * snapshot.cpu_count as u64
    } else if let Some(per_node) = snapshot.mem_per_node_mb {
        per_node
    } else {
        snapshot.host_available_mb
    };

    let budget = ResourceBudget {
        threads: thread_override.unwrap_or(snapshot.cpu_count).max(1),
        memory_mb: (raw_mb as f64 * MEMORY_SAFETY_MARGIN) as u64,
    };
    info!(
        "negotiated resources: {} threads, {} MB",
        budget.threads, budget.memory_mb
    );
    budget
}
