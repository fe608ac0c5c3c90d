//! Host load sampling: CPU, memory and the allowlisted GPUs.
//!
//! CPU and memory come from `sysinfo`; GPU figures from one `nvidia-smi`
//! query per sample. A host without `nvidia-smi` reports no GPUs.

use std::{collections::BTreeSet, process::Command, time::Duration};

use ailab_config::{GpuId, LabConfig};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tokio::sync::watch;

const GPU_QUERY: [&str; 2] = [
    "--query-gpu=index,utilization.gpu,memory.used,memory.total",
    "--format=csv,noheader,nounits",
];

/// Utilization of one GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuLoad {
    pub gpu: GpuId,
    /// Compute utilization in percent.
    pub utilization: f64,
    pub memory_used_mib: u64,
    pub memory_total_mib: u64,
}

impl GpuLoad {
    #[must_use]
    pub fn memory_percent(&self) -> f64 {
        percent(self.memory_used_mib, self.memory_total_mib)
    }
}

/// One sample of host load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub gpus: Vec<GpuLoad>,
}

/// Samples host load on an interval.
pub struct LoadSampler {
    system: System,
    allowlist: BTreeSet<GpuId>,
    interval: Duration,
    query_gpus: bool,
}

impl LoadSampler {
    #[must_use]
    pub fn new(config: &LabConfig) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new()
                .with_cpu(CpuRefreshKind::new().with_cpu_usage())
                .with_memory(MemoryRefreshKind::everything()),
        );
        Self {
            system,
            allowlist: config.gpus.iter().copied().collect(),
            interval: config.scan_interval(),
            query_gpus: !config.gpus.is_empty(),
        }
    }

    /// Take one sample. Blocks on the `nvidia-smi` query.
    pub fn sample(&mut self) -> ServerLoad {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let gpus = if self.query_gpus {
            match query_gpus() {
                Ok(gpus) => gpus
                    .into_iter()
                    .filter(|g| self.allowlist.contains(&g.gpu))
                    .collect(),
                Err(e) => {
                    tracing::warn!("GPU load unavailable, sampling CPU and memory only: {e}");
                    self.query_gpus = false;
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        ServerLoad {
            cpu_percent: round1(f64::from(self.system.global_cpu_info().cpu_usage())),
            memory_percent: round1(percent(
                self.system.used_memory(),
                self.system.total_memory(),
            )),
            gpus,
        }
    }

    /// Sample every interval and publish samples that differ from the last.
    /// Returns when every receiver is gone.
    pub async fn run(self, publish: watch::Sender<Option<ServerLoad>>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut sampler = self;
        loop {
            interval.tick().await;
            let sampled = tokio::task::spawn_blocking(move || {
                let load = sampler.sample();
                (sampler, load)
            })
            .await;

            let load = match sampled {
                Ok((returned, load)) => {
                    sampler = returned;
                    load
                }
                Err(e) => {
                    tracing::error!("load sampling aborted: {e}");
                    return;
                }
            };

            publish.send_if_modified(|current| {
                if current.as_ref() == Some(&load) {
                    return false;
                }
                *current = Some(load);
                true
            });
            if publish.is_closed() {
                return;
            }
        }
    }
}

fn query_gpus() -> Result<Vec<GpuLoad>, LoadError> {
    let output = Command::new("nvidia-smi")
        .args(GPU_QUERY)
        .output()
        .map_err(LoadError::Spawn)?;
    if !output.status.success() {
        return Err(LoadError::Failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(parse_gpu_query(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `index, utilization, memory.used, memory.total` rows. Rows with
/// unreadable fields (`[N/A]` on some boards) are skipped.
#[must_use]
pub fn parse_gpu_query(output: &str) -> Vec<GpuLoad> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let gpu = fields.next()?.parse().ok()?;
            let utilization: f64 = fields.next()?.parse().ok()?;
            let memory_used_mib = fields.next()?.parse().ok()?;
            let memory_total_mib = fields.next()?.parse().ok()?;
            Some(GpuLoad {
                gpu,
                utilization,
                memory_used_mib,
                memory_total_mib,
            })
        })
        .collect()
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Errors from the GPU query.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot run nvidia-smi: {0}")]
    Spawn(std::io::Error),
    #[error("nvidia-smi failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_parse_gpu_query() {
        let output = "0, 87, 20311, 24576\n1, 0, 3, 24576\n";
        let gpus = parse_gpu_query(output);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].gpu, 0);
        assert_eq!(gpus[0].utilization, 87.0);
        assert_eq!(gpus[0].memory_used_mib, 20311);
        assert_eq!(gpus[1].memory_total_mib, 24576);
    }

    #[test_case("2, [N/A], 100, 200" ; "unsupported field")]
    #[test_case("" ; "empty")]
    #[test_case("No devices were found" ; "driver message")]
    #[test_case("3, 50, 100" ; "missing column")]
    fn test_unreadable_rows_are_skipped(output: &str) {
        assert!(parse_gpu_query(output).is_empty());
    }

    #[test]
    fn test_memory_percent() {
        let load = GpuLoad {
            gpu: 0,
            utilization: 0.0,
            memory_used_mib: 512,
            memory_total_mib: 2048,
        };
        assert_eq!(load.memory_percent(), 25.0);
        assert_eq!(percent(1, 0), 0.0);
        assert_eq!(round1(33.333), 33.3);
    }

    #[test]
    fn test_sample_without_gpus() {
        let dir = tempfile::tempdir().unwrap();
        let config = LabConfig::new(
            [("p".to_string(), dir.path().to_path_buf())],
            vec![],
            dir.path(),
        );
        let load = LoadSampler::new(&config).sample();
        assert!(load.gpus.is_empty());
        assert!((0.0..=100.0).contains(&load.memory_percent));
    }
}
