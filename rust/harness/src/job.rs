//! Job specifications, lifecycle states and exit outcomes.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::gpu_pool::GpuSet;

/// Unique, monotonically increasing job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("job-").unwrap_or(s);
        digits
            .parse()
            .map(JobId)
            .map_err(|_| format!("invalid job id '{s}'"))
    }
}

/// What a user asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Project the job belongs to.
    pub project: String,
    /// Shell command line.
    pub command: String,
    /// Working directory relative to the project root.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Number of GPUs required.
    #[serde(default)]
    pub gpus: usize,
    /// Higher runs first; equal priorities run in submission order.
    #[serde(default)]
    pub priority: i32,
    /// Experiment directory the job writes to, relative to the project's
    /// experiment root. Defaults to `working_dir`.
    #[serde(default)]
    pub experiment: Option<String>,
}

fn default_working_dir() -> String {
    ".".to_string()
}

impl JobSpec {
    #[must_use]
    pub fn new(project: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            command: command.into(),
            working_dir: default_working_dir(),
            gpus: 0,
            priority: 0,
            experiment: None,
        }
    }

    #[must_use]
    pub fn with_gpus(mut self, gpus: usize) -> Self {
        self.gpus = gpus;
        self
    }

    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = Some(experiment.into());
        self
    }

    /// Experiment directory relative to the project's experiment root.
    #[must_use]
    pub fn experiment_dir(&self) -> &str {
        self.experiment.as_deref().unwrap_or(&self.working_dir)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue.
    Pending,
    /// GPUs granted, process not yet confirmed.
    Scheduled,
    /// Process is alive.
    Running,
    /// Exited with code 0.
    Succeeded,
    /// Non-zero exit, signal, launch error or lost process.
    Failed,
    /// Terminated on request.
    Killed,
}

impl JobState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }

    /// Scheduled or running: the job holds GPUs.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }

    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Scheduled)
                | (Self::Scheduled, Self::Running | Self::Failed)
                | (Self::Running, Self::Succeeded | Self::Failed | Self::Killed)
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a job's process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitOutcome {
    /// The process exited with a code.
    Exited { code: i32 },
    /// The process was ended by a signal.
    Signaled { signal: i32 },
    /// The process never started.
    LaunchFailed { error: String },
    /// The exit could not be observed (host restart, wait error).
    Lost { reason: String },
}

impl ExitOutcome {
    /// Terminal state implied by this outcome.
    #[must_use]
    pub fn terminal_state(&self, cancel_requested: bool) -> JobState {
        match self {
            Self::LaunchFailed { .. } => JobState::Failed,
            _ if cancel_requested => JobState::Killed,
            Self::Exited { code: 0 } => JobState::Succeeded,
            Self::Exited { .. } | Self::Signaled { .. } | Self::Lost { .. } => JobState::Failed,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exit code {code}"),
            Self::Signaled { signal } => write!(f, "signal {signal}"),
            Self::LaunchFailed { error } => write!(f, "launch failed: {error}"),
            Self::Lost { reason } => write!(f, "lost: {reason}"),
        }
    }
}

/// Runtime instance of a [`JobSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub state: JobState,
    /// GPUs granted at scheduling time; kept after exit for history.
    #[serde(default)]
    pub gpus: GpuSet,
    /// Resolved working directory.
    pub workdir: PathBuf,
    /// Directory holding `stdout.log` and `stderr.log`.
    pub log_dir: PathBuf,
    /// Process ID while running (process group leader).
    #[serde(default)]
    pub pid: Option<u32>,
    pub submitted_at: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub outcome: Option<ExitOutcome>,
    /// Launch error or stderr tail of a failed run.
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    /// Move to `next`, refusing edges the lifecycle does not allow.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                job: self.id,
                from: self.state,
                to: next,
            });
        }
        tracing::info!(job = %self.id, from = %self.state, to = %next, "job transition");
        self.state = next;
        Ok(())
    }
}

/// Attempted lifecycle edge that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{job}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(JobState::Pending, JobState::Scheduled, true ; "pending to scheduled")]
    #[test_case(JobState::Scheduled, JobState::Running, true ; "scheduled to running")]
    #[test_case(JobState::Scheduled, JobState::Failed, true ; "launch failure")]
    #[test_case(JobState::Running, JobState::Succeeded, true ; "running to succeeded")]
    #[test_case(JobState::Running, JobState::Killed, true ; "running to killed")]
    #[test_case(JobState::Pending, JobState::Running, false ; "cannot skip scheduled")]
    #[test_case(JobState::Scheduled, JobState::Succeeded, false ; "cannot skip running")]
    #[test_case(JobState::Pending, JobState::Killed, false ; "pending is removed not killed")]
    #[test_case(JobState::Succeeded, JobState::Failed, false ; "terminal is final")]
    #[test_case(JobState::Killed, JobState::Running, false ; "no resurrection")]
    fn test_transitions(from: JobState, to: JobState, allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test_case(ExitOutcome::Exited { code: 0 }, false, JobState::Succeeded ; "clean exit")]
    #[test_case(ExitOutcome::Exited { code: 2 }, false, JobState::Failed ; "non-zero exit")]
    #[test_case(ExitOutcome::Signaled { signal: 9 }, false, JobState::Failed ; "external kill")]
    #[test_case(ExitOutcome::Signaled { signal: 15 }, true, JobState::Killed ; "cancelled")]
    #[test_case(ExitOutcome::Exited { code: 0 }, true, JobState::Killed ; "cancelled but exited cleanly")]
    #[test_case(ExitOutcome::Lost { reason: "restart".into() }, false, JobState::Failed ; "lost")]
    #[test_case(ExitOutcome::LaunchFailed { error: "enoent".into() }, true, JobState::Failed ; "never started")]
    fn test_outcome_state(outcome: ExitOutcome, cancelled: bool, expected: JobState) {
        assert_eq!(outcome.terminal_state(cancelled), expected);
    }

    #[test]
    fn test_job_id_parse() {
        assert_eq!("job-12".parse::<JobId>().unwrap(), JobId(12));
        assert_eq!("7".parse::<JobId>().unwrap(), JobId(7));
        assert!("job-x".parse::<JobId>().is_err());
        assert_eq!(JobId(3).to_string(), "job-3");
    }

    #[test]
    fn test_spec_defaults_from_toml() {
        let spec: JobSpec = toml::from_str(
            r#"
project = "mnist"
command = "python train.py"
"#,
        )
        .unwrap();
        assert_eq!(spec.working_dir, ".");
        assert_eq!(spec.gpus, 0);
        assert_eq!(spec.priority, 0);
        assert_eq!(spec.experiment_dir(), ".");
        assert_eq!(spec.with_experiment("runs/a").experiment_dir(), "runs/a");
    }
}
