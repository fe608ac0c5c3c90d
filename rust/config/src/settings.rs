//! Scheduler and watcher settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Job scheduling and supervision settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Upper bound on jobs that are scheduled or running at once.
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
    /// Seconds between SIGTERM and SIGKILL when terminating a job.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Shell used to run job commands (`<shell> -c <command>`).
    #[serde(default = "default_shell")]
    pub shell: String,
    /// Reject jobs that need more GPUs than the allowlist holds instead of
    /// queueing them forever.
    #[serde(default = "default_true")]
    pub reject_oversized: bool,
    /// Extra environment passed to every job process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Finished jobs kept in the live table. Older ones move to the archive.
    #[serde(default = "default_keep_finished")]
    pub keep_finished: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: None,
            grace_period_secs: default_grace_period(),
            shell: default_shell(),
            reject_oversized: true,
            env: BTreeMap::new(),
            keep_finished: default_keep_finished(),
        }
    }
}

/// Log watcher settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherSettings {
    /// Seconds between scans.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// An experiment untouched for longer than this is flagged stale.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// How deep below an experiment root to look for experiment directories.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Series treated as primary when the producer does not flag one.
    #[serde(default = "default_primary_metric")]
    pub primary_metric: String,
    /// Upper bound on bytes read from one log file per scan.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
    /// Sample CPU, memory and GPU load alongside each scan.
    #[serde(default = "default_true")]
    pub sample_load: bool,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            stale_after_secs: default_stale_after(),
            max_depth: default_max_depth(),
            primary_metric: default_primary_metric(),
            max_read_bytes: default_max_read_bytes(),
            sample_load: true,
        }
    }
}

fn default_grace_period() -> u64 {
    10
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_finished() -> usize {
    100
}

fn default_interval() -> u64 {
    2
}

fn default_stale_after() -> u64 {
    600
}

fn default_max_depth() -> usize {
    5
}

fn default_primary_metric() -> String {
    "loss".to_string()
}

fn default_max_read_bytes() -> u64 {
    1024 * 1024
}
