//! Job admission, cancellation and the scheduling loop.

use std::{
    fmt,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use ailab_config::LabConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    gpu_pool::GpuPool,
    job::{JobId, JobSpec, JobState},
    queue::{JobTable, TableInner},
    runner::{ExecutionHost, ExitEvent},
    state::append_archive,
};

/// Messages handled by the scheduler loop.
#[derive(Debug)]
pub enum SchedulerEvent {
    Submitted(JobId),
    /// A pending job left the queue, which may unblock its head.
    Cancelled(JobId),
    Exited(ExitEvent),
    Shutdown,
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The job was pending and has been dropped.
    Removed,
    /// The job's process is being stopped; it will end as killed.
    Terminating,
    /// The job had already finished.
    AlreadyFinished,
}

impl fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Removed => "removed from queue",
            Self::Terminating => "terminating",
            Self::AlreadyFinished => "already finished",
        })
    }
}

/// Orders jobs onto GPUs.
///
/// The scheduler is the only writer of queue fields: queue position, GPU
/// set, the Pending to Scheduled transition and the cancel flag.
pub struct Scheduler {
    config: Arc<LabConfig>,
    table: Arc<JobTable>,
    pool: Arc<GpuPool>,
    host: Arc<ExecutionHost>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        config: Arc<LabConfig>,
        table: Arc<JobTable>,
        pool: Arc<GpuPool>,
        host: Arc<ExecutionHost>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            config,
            table,
            pool,
            host,
            events,
        }
    }

    /// Validate and enqueue a job.
    pub fn submit(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        let root = self
            .config
            .project_root(&spec.project)
            .ok_or_else(|| SubmitError::UnknownProject(spec.project.clone()))?;
        if spec.command.trim().is_empty() {
            return Err(SubmitError::EmptyCommand);
        }
        let workdir = resolve_working_dir(root, &spec.working_dir)?;
        if let Some(experiment) = &spec.experiment {
            relative_path(experiment).map_err(|reason| SubmitError::InvalidExperiment {
                dir: experiment.clone(),
                reason: reason.to_string(),
            })?;
        }

        let capacity = self.pool.capacity();
        if spec.gpus > capacity && self.config.scheduler.reject_oversized {
            return Err(SubmitError::ExceedsCapacity {
                requested: spec.gpus,
                capacity,
            });
        }

        let jobs_dir = self.config.jobs_dir();
        let (project, gpus) = (spec.project.clone(), spec.gpus);
        let id = self
            .table
            .update(|table| table.enqueue(spec, workdir, &jobs_dir));
        tracing::info!(job = %id, %project, gpus, "job submitted");

        if self.events.send(SchedulerEvent::Submitted(id)).is_err() {
            tracing::warn!(job = %id, "scheduler loop is not running");
        }
        Ok(id)
    }

    /// Cancel a job in any state.
    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CancelError> {
        let apply = |table: &mut TableInner| {
            let state = table.get(id).map(|j| j.state).ok_or(CancelError::NotFound(id))?;
            Ok(match state {
                JobState::Pending => {
                    table.remove_pending(id);
                    CancelOutcome::Removed
                }
                JobState::Scheduled | JobState::Running => {
                    if let Some(job) = table.get_mut(id) {
                        job.cancel_requested = true;
                    }
                    CancelOutcome::Terminating
                }
                JobState::Succeeded | JobState::Failed | JobState::Killed => {
                    CancelOutcome::AlreadyFinished
                }
            })
        };
        let outcome = self.table.update_if(apply, |outcome| {
            matches!(outcome, Ok(CancelOutcome::Removed | CancelOutcome::Terminating))
        })?;

        tracing::info!(job = %id, "cancel: {outcome}");
        match outcome {
            CancelOutcome::Removed => {
                let _ = self.events.send(SchedulerEvent::Cancelled(id));
            }
            // A scheduled job without a process yet is stopped right after
            // its launch sees the flag.
            CancelOutcome::Terminating => {
                self.host.terminate(id);
            }
            CancelOutcome::AlreadyFinished => {}
        }
        Ok(outcome)
    }

    /// Grant GPUs from the head of the queue and launch what was granted.
    ///
    /// Returns the launched jobs. A failed launch frees its GPUs, so the
    /// pass is repeated until nothing more can start.
    pub fn schedule_pass(&self) -> Vec<JobId> {
        let mut launched = Vec::new();
        loop {
            if self.table.read(|t| t.pending().is_empty()) {
                break;
            }
            let limit = self.config.scheduler.max_concurrent_jobs;
            let planned = self
                .table
                .update_if(|t| t.plan(&self.pool, limit), |planned| !planned.is_empty());
            if planned.is_empty() {
                break;
            }

            let mut freed = false;
            for job in planned {
                match self.host.launch(&job) {
                    Ok(handle) => launched.push(handle.job),
                    Err(_) => freed = true,
                }
            }
            if !freed {
                break;
            }
        }
        launched
    }

    /// Move finished jobs beyond `keep_finished` from the table to the
    /// archive. A job leaves the table only once it is archived.
    pub fn retire_finished(&self) -> usize {
        let retired = self
            .table
            .read(|t| t.retirable(self.config.scheduler.keep_finished));
        if retired.is_empty() {
            return 0;
        }

        let archive = self.config.archive_file();
        if let Err(e) = append_archive(&archive, &retired) {
            tracing::error!("cannot archive finished jobs, keeping them: {e}");
            return 0;
        }
        let ids: Vec<JobId> = retired.iter().map(|j| j.id).collect();
        let count = self
            .table
            .update_if(|t| t.retire(&ids), |count| *count > 0);
        tracing::info!(count, archive = %archive.display(), "retired finished jobs");
        count
    }

    /// Event loop: apply exits, then schedule. Runs until `Shutdown`.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SchedulerEvent>) {
        self.schedule_pass();

        while let Some(event) = events.recv().await {
            match event {
                SchedulerEvent::Submitted(id) | SchedulerEvent::Cancelled(id) => {
                    tracing::debug!(job = %id, "queue changed");
                }
                SchedulerEvent::Exited(exit) => {
                    self.host.finalize(exit);
                    self.retire_finished();
                }
                SchedulerEvent::Shutdown => {
                    tracing::info!("scheduler stopping");
                    break;
                }
            }
            self.schedule_pass();
        }
    }
}

/// Resolve `dir` below `root`, refusing anything that leaves the root.
fn resolve_working_dir(root: &Path, dir: &str) -> Result<PathBuf, SubmitError> {
    let invalid = |reason: &str| SubmitError::InvalidWorkingDir {
        dir: dir.to_string(),
        reason: reason.to_string(),
    };

    let relative = relative_path(dir).map_err(invalid)?;
    let path = if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    };

    // Symlinks may still point outside; check where an existing path lands.
    if let (Ok(real_root), Ok(real)) = (root.canonicalize(), path.canonicalize())
        && !real.starts_with(&real_root)
    {
        return Err(invalid("escapes the project root"));
    }
    Ok(path)
}

/// Normalize a path that must stay below some root.
fn relative_path(dir: &str) -> Result<PathBuf, &'static str> {
    let mut path = PathBuf::new();
    for component in Path::new(dir).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err("contains '..'"),
            Component::RootDir | Component::Prefix(_) => return Err("is absolute"),
        }
    }
    Ok(path)
}

/// Errors that reject a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("unknown project '{0}'")]
    UnknownProject(String),
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("working directory '{dir}' {reason}")]
    InvalidWorkingDir { dir: String, reason: String },
    #[error("experiment directory '{dir}' {reason}")]
    InvalidExperiment { dir: String, reason: String },
    #[error("{requested} GPUs requested but only {capacity} configured")]
    ExceedsCapacity { requested: usize, capacity: usize },
}

/// Errors that reject a cancellation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    #[error("{0} not found")]
    NotFound(JobId),
}
