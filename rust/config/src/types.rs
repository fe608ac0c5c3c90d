//! Top-level lab configuration, GPU ids and static validation.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{SchedulerSettings, WatcherSettings};

/// Physical GPU identifier, as exposed through `CUDA_VISIBLE_DEVICES`.
pub type GpuId = u32;

/// Project name under which experiments of the shared `results` tree are
/// reported.
pub const RESULTS_PROJECT: &str = "results";

/// Immutable runtime configuration of a lab daemon.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LabConfig {
    /// Address the external API layer binds to.
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Static credential map (user -> password).
    #[serde(default)]
    pub users: BTreeMap<String, String>,
    /// Project name -> project root directory.
    pub projects: BTreeMap<String, PathBuf>,
    /// GPU allowlist.
    #[serde(default)]
    pub gpus: Vec<GpuId>,
    /// Pick up experiment directories that appear after startup.
    #[serde(default)]
    pub auto_detect_experiments: bool,
    /// When set, experiments of project `P` live under `checkpoint_root/P`
    /// instead of the project root.
    #[serde(default)]
    pub checkpoint_root: Option<PathBuf>,
    /// Shared experiment tree that belongs to no project. Jobs cannot run
    /// there, but its experiments are watched like any other.
    #[serde(default)]
    pub results: Option<PathBuf>,
    /// Directory for the job journal, job logs and the exported status file.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Request drop-box. Defaults to `workspace/queue`.
    #[serde(default)]
    pub queue_dir: Option<PathBuf>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub watcher: WatcherSettings,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./ailab")
}

impl LabConfig {
    /// Minimal configuration with one project and the given GPUs.
    #[must_use]
    pub fn new(
        projects: impl IntoIterator<Item = (String, PathBuf)>,
        gpus: Vec<GpuId>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            users: BTreeMap::new(),
            projects: projects.into_iter().collect(),
            gpus,
            auto_detect_experiments: false,
            checkpoint_root: None,
            results: None,
            workspace: workspace.into(),
            queue_dir: None,
            scheduler: SchedulerSettings::default(),
            watcher: WatcherSettings::default(),
        }
    }

    /// Check required fields and cross-field constraints.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::ZeroPort);
        }
        if self.projects.is_empty() {
            return Err(ValidationError::NoProjects);
        }
        for name in self.projects.keys() {
            if name.trim().is_empty() || name.contains('/') || name.contains('\\') {
                return Err(ValidationError::ProjectName(name.clone()));
            }
        }
        if self.results.is_some() && self.projects.contains_key(RESULTS_PROJECT) {
            return Err(ValidationError::ReservedProject(RESULTS_PROJECT));
        }

        let mut seen = BTreeSet::new();
        for &gpu in &self.gpus {
            if !seen.insert(gpu) {
                return Err(ValidationError::DuplicateGpu(gpu));
            }
        }

        if self.watcher.interval_secs == 0 {
            return Err(ValidationError::Zero("watcher.interval_secs"));
        }
        if self.watcher.max_read_bytes == 0 {
            return Err(ValidationError::Zero("watcher.max_read_bytes"));
        }
        if self.scheduler.max_concurrent_jobs == Some(0) {
            return Err(ValidationError::Zero("scheduler.max_concurrent_jobs"));
        }
        if self.scheduler.shell.trim().is_empty() {
            return Err(ValidationError::EmptyShell);
        }

        Ok(())
    }

    /// Static credential lookup.
    #[must_use]
    pub fn authenticate(&self, user: &str, password: &str) -> bool {
        self.users.get(user).is_some_and(|p| p == password)
    }

    /// Whether requests must carry credentials.
    #[must_use]
    pub fn requires_auth(&self) -> bool {
        !self.users.is_empty()
    }

    /// Root of the experiment tree scanned for `project`.
    #[must_use]
    pub fn experiment_root(&self, project: &str) -> Option<PathBuf> {
        let root = self.projects.get(project)?;
        Some(match &self.checkpoint_root {
            Some(checkpoints) => checkpoints.join(project),
            None => root.clone(),
        })
    }

    /// Every tree the watcher scans, as `(project, root)`. The shared
    /// `results` tree comes last under [`RESULTS_PROJECT`].
    #[must_use]
    pub fn experiment_roots(&self) -> Vec<(String, PathBuf)> {
        let mut roots: Vec<(String, PathBuf)> = self
            .projects
            .keys()
            .filter_map(|p| Some((p.clone(), self.experiment_root(p)?)))
            .collect();
        if let Some(results) = &self.results {
            roots.push((RESULTS_PROJECT.to_string(), results.clone()));
        }
        roots
    }

    #[must_use]
    pub fn queue_dir(&self) -> PathBuf {
        self.queue_dir
            .clone()
            .unwrap_or_else(|| self.workspace.join("queue"))
    }

    /// Job journal used for crash recovery.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.workspace.join("jobs.json")
    }

    /// Append-only JSON lines of finished jobs retired from the journal.
    #[must_use]
    pub fn archive_file(&self) -> PathBuf {
        self.workspace.join("jobs-archive.jsonl")
    }

    /// Exported status snapshot read by `ailab status`.
    #[must_use]
    pub fn status_file(&self) -> PathBuf {
        self.workspace.join("status.json")
    }

    /// Parent of the per-job `stdout.log`/`stderr.log` directories.
    #[must_use]
    pub fn jobs_dir(&self) -> PathBuf {
        self.workspace.join("jobs")
    }

    #[must_use]
    pub fn project_root(&self, project: &str) -> Option<&Path> {
        self.projects.get(project).map(PathBuf::as_path)
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.watcher.interval_secs)
    }

    #[must_use]
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.watcher.stale_after_secs)
    }

    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.scheduler.grace_period_secs)
    }
}

/// Static configuration errors, reported once at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("port must be non-zero")]
    ZeroPort,
    #[error("at least one project must be configured")]
    NoProjects,
    #[error("invalid project name {0:?}")]
    ProjectName(String),
    #[error("project name {0:?} is reserved while `results` is set")]
    ReservedProject(&'static str),
    #[error("gpu {0} is listed more than once")]
    DuplicateGpu(GpuId),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("scheduler.shell must not be empty")]
    EmptyShell,
}
