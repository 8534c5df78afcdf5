//! CPU and memory accounting from cgroup v2 pseudo-files.
//!
//! CPU utilisation uses a two-sample protocol: [`CgroupSampler::snapshot`] records the usage
//! counter, the caller waits, then [`CgroupSampler::delta`] turns the difference into a
//! percentage. Keeping the wait outside lets many containers share one sampling window.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use futures::future;
use tokio::fs;

use crate::{
    config::{DEFAULT_CGROUP_PREFIX, DEFAULT_CGROUP_ROOT},
    models::MemoryUsage,
    utils::{format_bytes, host_cpu_count},
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The `memory.stat` fields counted as memory in use. Page cache is left out on purpose.
pub const MEMORY_STAT_FIELDS: [&str; 9] = [
    "anon",
    "kernel",
    "kernel_stack",
    "pagetables",
    "sec_pagetables",
    "percpu",
    "sock",
    "vmalloc",
    "shmem",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reads resource usage of containers from the cgroup v2 hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupSampler {
    root: PathBuf,
    prefix: String,
}

/// The first half of a CPU measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSample {
    /// The container the sample belongs to.
    pub name: String,

    /// The cumulative CPU time in microseconds.
    pub usage_usec: u64,

    /// The number of CPUs the container may run on.
    pub cpu_count: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CgroupSampler {
    /// Creates a sampler for LXC payload cgroups below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: DEFAULT_CGROUP_PREFIX.to_string(),
        }
    }

    /// Returns the cgroup directory of `name`.
    pub fn cgroup_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}{}", self.prefix, name))
    }

    /// Records the CPU usage counter of `name`.
    ///
    /// Returns `None` if the container has no cgroup, which is the case when it is not running.
    pub async fn snapshot(&self, name: &str) -> Option<CpuSample> {
        let dir = self.cgroup_dir(name);
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return None;
        }

        let usage_usec = read_usage_usec(&dir).await?;
        let cpu_count = fs::read_to_string(dir.join("cpuset.cpus.effective"))
            .await
            .ok()
            .and_then(|content| parse_cpuset(&content))
            .unwrap_or_else(host_cpu_count);

        Some(CpuSample {
            name: name.to_string(),
            usage_usec,
            cpu_count,
        })
    }

    /// Re-reads the usage counter and returns utilisation since `sample`, in percent.
    ///
    /// Assumes the caller waited one second since taking the sample.
    pub async fn delta(&self, sample: &CpuSample) -> f64 {
        match read_usage_usec(&self.cgroup_dir(&sample.name)).await {
            Some(usage_usec) => cpu_percent(sample.usage_usec, usage_usec, sample.cpu_count),
            None => 0.0,
        }
    }

    /// Returns the memory in use by `name`. A missing cgroup counts as zero.
    pub async fn memory(&self, name: &str) -> MemoryUsage {
        let bytes = fs::read_to_string(self.cgroup_dir(name).join("memory.stat"))
            .await
            .map(|content| parse_memory_stat(&content))
            .unwrap_or(0);

        MemoryUsage {
            bytes,
            formatted: format_bytes(bytes),
        }
    }

    /// Samples the CPU utilisation of every container in `names` over one shared `window`.
    ///
    /// Containers without a cgroup are left out of the result.
    pub async fn cpu_percent_all(
        &self,
        names: &[String],
        window: Duration,
    ) -> HashMap<String, f64> {
        let samples: Vec<CpuSample> =
            future::join_all(names.iter().map(|name| self.snapshot(name)))
                .await
                .into_iter()
                .flatten()
                .collect();

        if samples.is_empty() {
            return HashMap::new();
        }

        tokio::time::sleep(window).await;

        let percents = future::join_all(samples.iter().map(|sample| self.delta(sample))).await;
        samples
            .into_iter()
            .zip(percents)
            .map(|(sample, percent)| (sample.name, percent))
            .collect()
    }
}

impl Default for CgroupSampler {
    fn default() -> Self {
        Self::new(DEFAULT_CGROUP_ROOT)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn read_usage_usec(dir: &Path) -> Option<u64> {
    let content = fs::read_to_string(dir.join("cpu.stat")).await.ok()?;
    parse_usage_usec(&content)
}

/// Extracts `usage_usec` from the contents of `cpu.stat`.
pub fn parse_usage_usec(cpu_stat: &str) -> Option<u64> {
    cpu_stat.lines().find_map(|line| {
        let (key, value) = line.split_once(char::is_whitespace)?;
        (key == "usage_usec")
            .then(|| value.trim().parse().ok())
            .flatten()
    })
}

/// Counts the CPUs in a cpuset list such as `0-3,6,8-9`.
///
/// Returns `None` for an empty or malformed list.
pub fn parse_cpuset(cpuset: &str) -> Option<usize> {
    let cpuset = cpuset.trim();
    if cpuset.is_empty() {
        return None;
    }

    let mut count = 0;
    for part in cpuset.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.parse().ok()?;
                let end: usize = end.parse().ok()?;
                if end < start {
                    return None;
                }
                count += end - start + 1;
            }
            None => {
                part.parse::<usize>().ok()?;
                count += 1;
            }
        }
    }

    (count > 0).then_some(count)
}

/// Sums the counted fields of a `memory.stat` file.
pub fn parse_memory_stat(memory_stat: &str) -> u64 {
    memory_stat
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?;
            MEMORY_STAT_FIELDS
                .contains(&key)
                .then(|| value.parse::<u64>().ok())
                .flatten()
        })
        .sum()
}

/// Turns two usage readings one second apart into a percentage of `cpu_count` CPUs.
pub fn cpu_percent(before_usec: u64, after_usec: u64, cpu_count: usize) -> f64 {
    let cpu_count = cpu_count.max(1) as f64;
    let used = after_usec.saturating_sub(before_usec) as f64;
    (used / (cpu_count * 10_000.0)).clamp(0.0, 100.0)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
