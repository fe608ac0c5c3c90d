//! Process execution and supervision for scheduled jobs.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fs::OpenOptions,
    io::{SeekFrom, Write},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use ailab_config::LabConfig;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    process::{Child, Command},
    sync::{mpsc, watch},
};

use crate::{
    gpu_pool::{GpuPool, PoolError},
    job::{ExitOutcome, Job, JobId, JobState},
    queue::JobTable,
    scheduler::SchedulerEvent,
    state::{is_process_alive, now_timestamp},
};

/// Lines of stderr kept as the error text of a failed job.
const STDERR_TAIL_LINES: usize = 20;
/// Bytes read from the end of `stderr.log` to find the tail.
const STDERR_TAIL_BYTES: u64 = 64 * 1024;
/// Poll interval for processes adopted after a restart.
const ADOPTED_POLL: Duration = Duration::from_millis(500);

/// Exit report sent by a job's monitor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub job: JobId,
    pub outcome: ExitOutcome,
    /// Last lines of the job's stderr.
    pub stderr_tail: Vec<String>,
}

/// Handle to a launched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHandle {
    pub job: JobId,
    pub pid: u32,
}

/// Launches job processes, supervises them and applies their exits.
///
/// The host is the only writer of process fields on a job: pid, start and
/// end times, outcome, and the Running and terminal transitions.
pub struct ExecutionHost {
    table: Arc<JobTable>,
    pool: Arc<GpuPool>,
    shell: String,
    env: BTreeMap<String, String>,
    grace: Duration,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    /// Terminate switches of live monitor tasks.
    handles: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl ExecutionHost {
    #[must_use]
    pub fn new(
        config: &LabConfig,
        table: Arc<JobTable>,
        pool: Arc<GpuPool>,
        events: mpsc::UnboundedSender<SchedulerEvent>,
    ) -> Self {
        Self {
            table,
            pool,
            shell: config.scheduler.shell.clone(),
            env: config.scheduler.env.clone(),
            grace: config.grace_period(),
            events,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<JobId, watch::Sender<bool>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a scheduled job.
    ///
    /// On failure the job is finalized as `LaunchFailed`, its GPUs are
    /// released, and the error is returned.
    pub fn launch(&self, job: &Job) -> Result<RunHandle, RunError> {
        match self.spawn(job) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                tracing::error!(job = %job.id, "launch failed: {e}");
                self.finalize(ExitEvent {
                    job: job.id,
                    outcome: ExitOutcome::LaunchFailed {
                        error: e.to_string(),
                    },
                    stderr_tail: Vec::new(),
                });
                Err(e)
            }
        }
    }

    fn spawn(&self, job: &Job) -> Result<RunHandle, RunError> {
        if !job.workdir.is_dir() {
            return Err(RunError::WorkingDir(job.workdir.clone()));
        }
        std::fs::create_dir_all(&job.log_dir)
            .map_err(|e| RunError::LogDir(job.log_dir.clone(), e))?;

        let banner = format!("--- {} started at {} ---\n", job.id, now_timestamp());
        let stdout = open_log(&job.log_dir.join("stdout.log"), &banner)?;
        let stderr = open_log(&job.log_dir.join("stderr.log"), &banner)?;

        let visible = job
            .gpus
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        tracing::debug!(job = %job.id, "spawning: {} -c {}", self.shell, job.spec.command);

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&job.spec.command)
            .current_dir(&job.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .envs(&self.env)
            .env("CUDA_VISIBLE_DEVICES", visible)
            .env("AILAB_JOB_ID", job.id.0.to_string())
            .process_group(0);

        let child = cmd.spawn().map_err(|e| RunError::Spawn(job.id, e))?;
        let Some(pid) = child.id() else {
            return Err(RunError::Spawn(job.id, std::io::Error::other("no PID")));
        };

        let (terminate_tx, terminate_rx) = watch::channel(false);
        self.handles().insert(job.id, terminate_tx);

        let cancel_requested = self.table.update(|table| {
            let Some(entry) = table.get_mut(job.id) else {
                return Err(job.id);
            };
            entry.transition(JobState::Running).map_err(|e| {
                tracing::error!("{e}");
                job.id
            })?;
            entry.pid = Some(pid);
            entry.started_at = Some(now_timestamp());
            Ok(entry.cancel_requested)
        });

        tracing::info!(job = %job.id, pid, gpus = ?job.gpus, "job started");

        tokio::spawn(monitor(
            child,
            job.id,
            pid,
            job.log_dir.join("stderr.log"),
            self.grace,
            terminate_rx,
            self.events.clone(),
        ));

        // Cancelled while scheduled, or no longer ours to run.
        if cancel_requested != Ok(false) {
            self.terminate(job.id);
        }

        Ok(RunHandle { job: job.id, pid })
    }

    /// Resume supervising a job that survived a restart.
    ///
    /// Its GPUs are claimed again and its pid is polled; the exit status of a
    /// process we did not spawn is unknowable, so it ends as lost.
    pub fn adopt(&self, job: &Job) -> Result<(), PoolError> {
        let Some(pid) = job.pid else {
            return Ok(());
        };
        self.pool.claim(job.id, &job.gpus)?;

        let (terminate_tx, terminate_rx) = watch::channel(false);
        self.handles().insert(job.id, terminate_tx);

        tokio::spawn(monitor_adopted(
            job.id,
            pid,
            job.log_dir.join("stderr.log"),
            self.grace,
            terminate_rx,
            self.events.clone(),
        ));

        if job.cancel_requested {
            self.terminate(job.id);
        }
        Ok(())
    }

    /// Ask a job's monitor to stop the process. Idempotent.
    ///
    /// Returns false if no live process is known for `job`.
    pub fn terminate(&self, job: JobId) -> bool {
        let handles = self.handles();
        let Some(switch) = handles.get(&job) else {
            return false;
        };
        if !*switch.borrow() {
            tracing::info!(%job, "terminating job");
        }
        switch.send_replace(true);
        true
    }

    /// Apply an exit: terminal transition plus GPU release, exactly once.
    ///
    /// Returns whether the job changed. A second event for a job that is
    /// already terminal is ignored.
    pub fn finalize(&self, event: ExitEvent) -> bool {
        self.handles().remove(&event.job);

        self.table.update(|table| {
            let Some(job) = table.get_mut(event.job) else {
                tracing::warn!(job = %event.job, "exit for unknown job");
                return false;
            };
            if job.state.is_terminal() {
                tracing::warn!(job = %event.job, state = %job.state, "duplicate exit ignored");
                return false;
            }

            let next = event.outcome.terminal_state(job.cancel_requested);
            if let Err(e) = job.transition(next) {
                tracing::error!("{e}");
                return false;
            }

            job.pid = None;
            job.finished_at = Some(now_timestamp());
            job.error = match next {
                JobState::Succeeded => None,
                _ if event.stderr_tail.is_empty() => Some(event.outcome.to_string()),
                _ => Some(event.stderr_tail.join("\n")),
            };

            match next {
                JobState::Succeeded => tracing::info!(job = %job.id, "job succeeded"),
                JobState::Killed => tracing::info!(job = %job.id, "job killed"),
                _ => tracing::warn!(job = %job.id, outcome = %event.outcome, "job failed"),
            }
            job.outcome = Some(event.outcome);

            if let Err(e) = self.pool.release(job.id, &job.gpus) {
                tracing::error!(job = %job.id, "gpu release fault: {e}");
                let freed = self.pool.reclaim(job.id);
                tracing::warn!(job = %job.id, ?freed, "reclaimed GPUs after fault");
            }
            true
        })
    }
}

fn open_log(path: &Path, banner: &str) -> Result<std::fs::File, RunError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| RunError::LogDir(path.to_path_buf(), e))?;
    if file.metadata().is_ok_and(|m| m.len() > 0) {
        file.write_all(b"\n")
            .map_err(|e| RunError::LogDir(path.to_path_buf(), e))?;
    }
    file.write_all(banner.as_bytes())
        .map_err(|e| RunError::LogDir(path.to_path_buf(), e))?;
    Ok(file)
}

/// Resolves once a terminate is requested. Never resolves if the switch is
/// dropped.
async fn terminate_requested(switch: &mut watch::Receiver<bool>) {
    if switch.wait_for(|t| *t).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn signal_group(pid: u32, signal: i32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill only sends a signal; a negative pid targets the group.
    let sent = unsafe { libc::kill(-pid, signal) } == 0;
    if !sent {
        // SAFETY: as above, for the leader alone.
        unsafe { libc::kill(pid, signal) };
    }
}

fn outcome_of(status: std::io::Result<ExitStatus>) -> ExitOutcome {
    match status {
        Ok(status) => match (status.code(), status.signal()) {
            (Some(code), _) => ExitOutcome::Exited { code },
            (None, Some(signal)) => ExitOutcome::Signaled { signal },
            (None, None) => ExitOutcome::Lost {
                reason: "no exit code or signal".into(),
            },
        },
        Err(e) => ExitOutcome::Lost {
            reason: format!("wait failed: {e}"),
        },
    }
}

/// Wait for a spawned job to exit or be terminated, then report its exit.
async fn monitor(
    mut child: Child,
    job: JobId,
    pid: u32,
    stderr_log: PathBuf,
    grace: Duration,
    mut switch: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        () = terminate_requested(&mut switch) => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            signal_group(pid, libc::SIGTERM);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(%job, "grace period expired, sending SIGKILL");
                    signal_group(pid, libc::SIGKILL);
                    child.wait().await
                }
            }
        }
    };

    report(job, outcome_of(status), &stderr_log, &events).await;
}

/// Poll an adopted pid until it disappears or is terminated.
async fn monitor_adopted(
    job: JobId,
    pid: u32,
    stderr_log: PathBuf,
    grace: Duration,
    mut switch: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
) {
    let mut poll = tokio::time::interval(ADOPTED_POLL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                if !is_process_alive(pid) {
                    break;
                }
            }
            () = terminate_requested(&mut switch) => {
                signal_group(pid, libc::SIGTERM);
                let deadline = tokio::time::Instant::now() + grace;
                while is_process_alive(pid) && tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(ADOPTED_POLL).await;
                }
                if is_process_alive(pid) {
                    tracing::warn!(%job, "grace period expired, sending SIGKILL");
                    signal_group(pid, libc::SIGKILL);
                }
                break;
            }
        }
    }

    let outcome = ExitOutcome::Lost {
        reason: "adopted process exited; status unavailable".into(),
    };
    report(job, outcome, &stderr_log, &events).await;
}

async fn report(
    job: JobId,
    outcome: ExitOutcome,
    stderr_log: &Path,
    events: &mpsc::UnboundedSender<SchedulerEvent>,
) {
    let stderr_tail = read_tail(stderr_log, STDERR_TAIL_LINES)
        .await
        .unwrap_or_default();
    let event = ExitEvent {
        job,
        outcome,
        stderr_tail,
    };
    if events.send(SchedulerEvent::Exited(event)).is_err() {
        tracing::debug!(%job, "scheduler gone, exit not reported");
    }
}

/// Last `lines` non-empty lines of a log file.
async fn read_tail(path: &Path, lines: usize) -> std::io::Result<Vec<String>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(STDERR_TAIL_BYTES)))
        .await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    let text = String::from_utf8_lossy(&buf);
    let mut tail = VecDeque::with_capacity(lines);
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        if tail.len() >= lines {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }
    Ok(tail.into_iter().collect())
}

/// Errors that can occur when launching a job.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("working directory {0} does not exist")]
    WorkingDir(PathBuf),
    #[error("failed to prepare log file {0}: {1}")]
    LogDir(PathBuf, std::io::Error),
    #[error("failed to spawn process for {0}: {1}")]
    Spawn(JobId, std::io::Error),
}
