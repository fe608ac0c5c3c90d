//! Job journal persistence and restart reconciliation.
//!
//! The journal is a JSON snapshot of the job table, rewritten after every
//! table change so jobs survive a coordinator restart.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{
    job::{ExitOutcome, Job, JobId, JobState},
    queue::{JobTable, TableInner},
};

/// Persistent snapshot of every known job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journal {
    /// Version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Next id to hand out, so ids are never reused across restarts.
    #[serde(default = "default_next_id")]
    pub next_id: u64,
    #[serde(default)]
    pub jobs: Vec<Job>,
}

impl Default for Journal {
    fn default() -> Self {
        Self {
            version: default_version(),
            next_id: default_next_id(),
            jobs: Vec::new(),
        }
    }
}

fn default_version() -> u32 {
    1
}

fn default_next_id() -> u64 {
    1
}

/// Manages journal persistence with file locking.
pub struct StateManager {
    /// Path to the journal file.
    pub path: PathBuf,
}

impl StateManager {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load the journal, or an empty one if the file doesn't exist.
    pub fn load(&self) -> Result<Journal, StateError> {
        if !self.path.exists() {
            return Ok(Journal::default());
        }

        let file = File::open(&self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;
        file.lock_shared()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        let journal = serde_json::from_reader(BufReader::new(&file))
            .map_err(|e| StateError::Parse(self.path.clone(), e.to_string()))?;

        file.unlock()
            .map_err(|e| StateError::Lock(self.path.clone(), e))?;

        Ok(journal)
    }

    /// Write the journal next to its final path, then rename it into place.
    pub fn save(&self, journal: &Journal) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let file = File::create(&tmp).map_err(|e| StateError::Io(tmp.clone(), e))?;
        file.lock_exclusive()
            .map_err(|e| StateError::Lock(tmp.clone(), e))?;

        let mut writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(&mut writer, journal)
            .map_err(|e| StateError::Write(tmp.clone(), e.to_string()))?;
        writer
            .flush()
            .map_err(|e| StateError::Io(tmp.clone(), e))?;
        drop(writer);

        file.unlock().map_err(|e| StateError::Lock(tmp.clone(), e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StateError::Io(self.path.clone(), e))?;

        Ok(())
    }

    /// Snapshot the table and save it.
    pub fn save_table(&self, table: &JobTable) -> Result<(), StateError> {
        let journal = table.read(TableInner::to_journal);
        self.save(&journal)
    }

    /// Save the table every time it changes. Bursts of changes collapse into
    /// one write.
    pub async fn run(self, table: Arc<JobTable>) {
        let mut changes = table.subscribe();
        while changes.changed().await.is_ok() {
            if let Err(e) = self.save_table(&table) {
                tracing::error!("failed to write journal: {e}");
            }
        }
    }
}

/// Append finished jobs to the archive, one JSON object per line.
pub fn append_archive(path: &Path, jobs: &[Job]) -> Result<(), StateError> {
    if jobs.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StateError::Io(parent.to_path_buf(), e))?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StateError::Io(path.to_path_buf(), e))?;
    file.lock_exclusive()
        .map_err(|e| StateError::Lock(path.to_path_buf(), e))?;

    let mut writer = BufWriter::new(&file);
    for job in jobs {
        serde_json::to_writer(&mut writer, job)
            .map_err(|e| StateError::Write(path.to_path_buf(), e.to_string()))?;
        writer
            .write_all(b"\n")
            .map_err(|e| StateError::Io(path.to_path_buf(), e))?;
    }
    writer
        .flush()
        .map_err(|e| StateError::Io(path.to_path_buf(), e))?;
    drop(writer);

    file.unlock()
        .map_err(|e| StateError::Lock(path.to_path_buf(), e))?;
    Ok(())
}

/// What restart reconciliation did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Running jobs whose process is still alive.
    pub adopted: Vec<JobId>,
    /// Running jobs whose process is gone.
    pub lost: Vec<JobId>,
    /// Jobs that were granted GPUs but never confirmed running.
    pub unlaunched: Vec<JobId>,
}

/// Settle jobs the previous coordinator left in flight.
///
/// Pending jobs stay queued. Scheduled jobs fail because their launch was
/// never confirmed. Running jobs are adopted if their process still exists
/// and fail as lost otherwise.
pub fn reconcile(journal: &mut Journal, alive: impl Fn(u32) -> bool) -> Reconciliation {
    let mut report = Reconciliation::default();

    for job in &mut journal.jobs {
        match job.state {
            JobState::Scheduled => {
                tracing::warn!(job = %job.id, "launch was never confirmed, marking failed");
                settle(
                    job,
                    ExitOutcome::Lost {
                        reason: "coordinator restarted before launch".into(),
                    },
                );
                report.unlaunched.push(job.id);
            }
            JobState::Running if job.pid.is_some_and(&alive) => {
                tracing::info!(job = %job.id, pid = ?job.pid, "adopting running job");
                report.adopted.push(job.id);
            }
            JobState::Running => {
                tracing::warn!(job = %job.id, pid = ?job.pid, "process is gone after restart");
                settle(
                    job,
                    ExitOutcome::Lost {
                        reason: "process crashed or coordinator restarted".into(),
                    },
                );
                report.lost.push(job.id);
            }
            _ => {}
        }
    }

    report
}

fn settle(job: &mut Job, outcome: ExitOutcome) {
    let next = outcome.terminal_state(job.cancel_requested);
    if let Err(e) = job.transition(next) {
        tracing::error!("{e}");
        return;
    }
    job.error = Some(outcome.to_string());
    job.outcome = Some(outcome);
    job.pid = None;
    job.finished_at = Some(now_timestamp());
}

/// Check if a process is alive by PID.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Current local time, second resolution.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur with journal persistence.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read/write journal {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock journal {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("failed to parse journal {0}: {1}")]
    Parse(PathBuf, String),
    #[error("failed to write journal {0}: {1}")]
    Write(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::job::JobSpec;

    fn journal_with(states: &[(JobState, Option<u32>)]) -> Journal {
        let mut table = TableInner::default();
        for _ in states {
            table.enqueue(
                JobSpec::new("p", "sleep 100"),
                PathBuf::from("/tmp"),
                Path::new("/tmp/jobs"),
            );
        }
        let mut journal = table.to_journal();
        for (job, (state, pid)) in journal.jobs.iter_mut().zip(states) {
            job.state = *state;
            job.pid = *pid;
        }
        journal
    }

    #[test]
    fn test_journal_roundtrip() {
        let dir = tempdir().unwrap();
        let manager = StateManager::new(dir.path().join("jobs.json"));

        let journal = journal_with(&[(JobState::Pending, None), (JobState::Running, Some(42))]);
        manager.save(&journal).unwrap();
        let loaded = manager.load().unwrap();

        assert_eq!(loaded.next_id, 3);
        assert_eq!(loaded.jobs, journal.jobs);
        assert!(!dir.path().join("jobs.json.tmp").exists());
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let journal = StateManager::new(dir.path().join("none.json")).load().unwrap();
        assert!(journal.jobs.is_empty());
        assert_eq!(journal.next_id, 1);
    }

    #[test]
    fn test_corrupt_journal_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            StateManager::new(&path).load(),
            Err(StateError::Parse(..))
        ));
    }

    #[test]
    fn test_reconcile() {
        let mut journal = journal_with(&[
            (JobState::Pending, None),
            (JobState::Scheduled, None),
            (JobState::Running, Some(100)),
            (JobState::Running, Some(200)),
            (JobState::Running, None),
        ]);
        journal.jobs[3].cancel_requested = true;

        let report = reconcile(&mut journal, |pid| pid == 100);

        assert_eq!(report.adopted, vec![JobId(3)]);
        assert_eq!(report.lost, vec![JobId(4), JobId(5)]);
        assert_eq!(report.unlaunched, vec![JobId(2)]);

        let states: Vec<JobState> = journal.jobs.iter().map(|j| j.state).collect();
        assert_eq!(
            states,
            vec![
                JobState::Pending,
                JobState::Failed,
                JobState::Running,
                JobState::Killed,
                JobState::Failed,
            ]
        );
        assert!(matches!(
            journal.jobs[3].outcome,
            Some(ExitOutcome::Lost { .. })
        ));
        assert_eq!(journal.jobs[3].pid, None);
        assert!(journal.jobs[4].finished_at.is_some());
    }

    #[test]
    fn test_archive_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ws/jobs-archive.jsonl");
        let journal = journal_with(&[(JobState::Succeeded, None), (JobState::Failed, None)]);

        append_archive(&path, &journal.jobs[..1]).unwrap();
        append_archive(&path, &journal.jobs[1..]).unwrap();
        append_archive(&path, &[]).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        let archived: Vec<Job> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(archived, journal.jobs);
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(u32::MAX));
    }
}
