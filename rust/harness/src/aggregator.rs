//! Merged view of jobs, GPUs and experiment records.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use ailab_config::LabConfig;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    experiment::ExperimentRecord,
    gpu_pool::{GpuPool, PoolSnapshot},
    job::{Job, JobId, JobState},
    load::ServerLoad,
    queue::JobTable,
    state::now_timestamp,
    watcher::Records,
};

/// Where an entry's live information comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    /// An active job is attached.
    Job,
    /// Only logs, or a finished job.
    Logs,
}

/// One experiment, or one job that has nothing on disk yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// `project/experiment` or `project/job-N`.
    pub key: String,
    pub project: String,
    pub source: EntrySource,
    pub job: Option<Job>,
    pub record: Option<ExperimentRecord>,
}

/// Derived snapshot answered by [`Aggregator::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub generated_at: String,
    pub gpus: PoolSnapshot,
    /// Latest host load sample, if sampling is enabled and has run.
    #[serde(default)]
    pub load: Option<ServerLoad>,
    pub jobs: Vec<Job>,
    pub entries: Vec<StatusEntry>,
}

impl StatusView {
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&StatusEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    #[must_use]
    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

/// Answers status queries from the job table, the pool and the watcher.
#[derive(Clone)]
pub struct Aggregator {
    config: Arc<LabConfig>,
    table: Arc<JobTable>,
    pool: Arc<GpuPool>,
    records: watch::Receiver<Records>,
    load: watch::Receiver<Option<ServerLoad>>,
}

impl Aggregator {
    #[must_use]
    pub fn new(
        config: Arc<LabConfig>,
        table: Arc<JobTable>,
        pool: Arc<GpuPool>,
        records: watch::Receiver<Records>,
        load: watch::Receiver<Option<ServerLoad>>,
    ) -> Self {
        Self {
            config,
            table,
            pool,
            records,
            load,
        }
    }

    /// Build a fresh view. Nothing is cached between calls.
    #[must_use]
    pub fn query(&self) -> StatusView {
        let jobs = self.table.snapshot();
        let gpus = self.pool.snapshot();
        let records = self.records.borrow().clone();
        let mut view = build_view(&self.config, jobs, gpus, &records);
        view.load = self.load.borrow().clone();
        view
    }

    /// Notifications for job table, watcher and load changes.
    #[must_use]
    pub fn subscribe(&self) -> StatusUpdates {
        let mut records = self.records.clone();
        records.mark_unchanged();
        let mut load = self.load.clone();
        load.mark_unchanged();
        StatusUpdates {
            jobs: self.table.subscribe(),
            records,
            load,
            load_open: true,
        }
    }
}

/// Change notifications for a [`StatusView`].
pub struct StatusUpdates {
    jobs: watch::Receiver<u64>,
    records: watch::Receiver<Records>,
    load: watch::Receiver<Option<ServerLoad>>,
    load_open: bool,
}

impl StatusUpdates {
    /// Wait for the next change. Returns false once the job table or the
    /// watcher has shut down; load sampling is optional and may stop.
    pub async fn changed(&mut self) -> bool {
        loop {
            tokio::select! {
                r = self.jobs.changed() => return r.is_ok(),
                r = self.records.changed() => return r.is_ok(),
                r = self.load.changed(), if self.load_open => {
                    if r.is_ok() {
                        return true;
                    }
                    self.load_open = false;
                }
            }
        }
    }
}

/// The directory a job writes its experiment to, if it names one below the
/// experiment root.
///
/// A job left at the root (the default working dir `.`) claims nothing:
/// every experiment of the project lives under that root.
fn experiment_dir(config: &LabConfig, job: &Job) -> Option<PathBuf> {
    let root = config.experiment_root(&job.spec.project)?;
    let dir = root.join(job.spec.experiment_dir());
    // Path equality compares components, so a trailing `.` is ignored.
    (dir != root).then_some(dir)
}

/// Merge jobs and records into entries.
///
/// A record is linked to a job whose experiment directory contains it; the
/// most recent active job wins, otherwise the most recent finished one.
/// Jobs running at the project root are never linked.
#[must_use]
pub fn build_view(
    config: &LabConfig,
    jobs: Vec<Job>,
    gpus: PoolSnapshot,
    records: &BTreeMap<String, ExperimentRecord>,
) -> StatusView {
    let dirs: Vec<(usize, PathBuf)> = jobs
        .iter()
        .enumerate()
        .filter(|(_, j)| j.state != JobState::Pending)
        .filter_map(|(i, j)| Some((i, experiment_dir(config, j)?)))
        .collect();

    let mut linked = BTreeSet::new();
    let mut entries = Vec::with_capacity(records.len());

    for (key, record) in records {
        let candidates = dirs.iter().filter(|(i, dir)| {
            jobs[*i].spec.project == record.project && record.path.starts_with(dir)
        });
        let best = candidates
            .map(|(i, _)| &jobs[*i])
            .max_by_key(|j| (j.state.is_active(), j.id));

        if let Some(job) = best {
            linked.insert(job.id);
        }
        entries.push(StatusEntry {
            key: key.clone(),
            project: record.project.clone(),
            source: source_of(best),
            job: best.cloned(),
            record: Some(record.clone()),
        });
    }

    for job in jobs.iter().filter(|j| !linked.contains(&j.id)) {
        entries.push(StatusEntry {
            key: format!("{}/{}", job.spec.project, job.id),
            project: job.spec.project.clone(),
            source: source_of(Some(job)),
            job: Some(job.clone()),
            record: None,
        });
    }

    StatusView {
        generated_at: now_timestamp(),
        gpus,
        load: None,
        jobs,
        entries,
    }
}

fn source_of(job: Option<&Job>) -> EntrySource {
    if job.is_some_and(|j| j.state.is_active() || j.state == JobState::Pending) {
        EntrySource::Job
    } else {
        EntrySource::Logs
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use test_case::test_case;

    use super::*;
    use crate::{job::JobSpec, queue::TableInner};

    fn config() -> LabConfig {
        LabConfig::new(
            [("p".to_string(), PathBuf::from("/srv/p"))],
            vec![],
            "/srv/ws",
        )
    }

    fn jobs(specs: &[(JobSpec, JobState)]) -> Vec<Job> {
        let mut table = TableInner::default();
        for (spec, _) in specs {
            table.enqueue(spec.clone(), PathBuf::from("/srv/p"), Path::new("/srv/ws/jobs"));
        }
        let mut jobs: Vec<Job> = table.jobs().cloned().collect();
        for (job, (_, state)) in jobs.iter_mut().zip(specs) {
            job.state = *state;
        }
        jobs
    }

    fn records(names: &[&str]) -> BTreeMap<String, ExperimentRecord> {
        names
            .iter()
            .map(|n| {
                let record = ExperimentRecord::new("p", *n, Path::new("/srv/p").join(n));
                (record.key(), record)
            })
            .collect()
    }

    fn empty_pool() -> PoolSnapshot {
        GpuPool::new([]).snapshot()
    }

    #[test]
    fn test_logs_only_experiment() {
        let view = build_view(&config(), Vec::new(), empty_pool(), &records(&["runs/a"]));
        let entry = view.entry("p/runs/a").unwrap();
        assert_eq!(entry.source, EntrySource::Logs);
        assert!(entry.job.is_none());
    }

    #[test]
    fn test_active_job_preferred_over_newer_finished() {
        let jobs = jobs(&[
            (JobSpec::new("p", "a").with_experiment("runs"), JobState::Running),
            (JobSpec::new("p", "b").with_experiment("runs/a"), JobState::Failed),
        ]);
        let view = build_view(&config(), jobs, empty_pool(), &records(&["runs/a"]));

        let entry = view.entry("p/runs/a").unwrap();
        assert_eq!(entry.source, EntrySource::Job);
        assert_eq!(entry.job.as_ref().map(|j| j.id), Some(JobId(1)));
        // The finished job has no experiment of its own.
        assert!(view.entry("p/job-2").is_some());
    }

    #[test]
    fn test_finished_job_keeps_serving_logs() {
        let jobs = jobs(&[
            (JobSpec::new("p", "a").with_experiment("runs/a"), JobState::Succeeded),
            (JobSpec::new("p", "b").with_experiment("runs/a"), JobState::Killed),
        ]);
        let view = build_view(&config(), jobs, empty_pool(), &records(&["runs/a"]));
        let entry = view.entry("p/runs/a").unwrap();
        assert_eq!(entry.source, EntrySource::Logs);
        assert_eq!(entry.job.as_ref().map(|j| j.id), Some(JobId(2)));
        assert!(entry.record.is_some());
    }

    #[test]
    fn test_job_without_experiment_gets_entry() {
        let jobs = jobs(&[(JobSpec::new("p", "a").with_experiment("new"), JobState::Pending)]);
        let view = build_view(&config(), jobs, empty_pool(), &records(&["runs/a"]));
        assert_eq!(view.entries.len(), 2);
        let entry = view.entry("p/job-1").unwrap();
        assert_eq!(entry.source, EntrySource::Job);
        assert!(entry.record.is_none());
    }

    #[test_case(JobState::Running ; "running")]
    #[test_case(JobState::Killed ; "finished")]
    fn test_job_at_project_root_claims_nothing(state: JobState) {
        let jobs = jobs(&[(JobSpec::new("p", "train"), state)]);
        let view = build_view(&config(), jobs, empty_pool(), &records(&["runs/old", "runs/other"]));

        for key in ["p/runs/old", "p/runs/other"] {
            let entry = view.entry(key).unwrap();
            assert_eq!(entry.source, EntrySource::Logs);
            assert!(entry.job.is_none(), "{key} must stay unlinked");
        }
        assert!(view.entry("p/job-1").is_some_and(|e| e.record.is_none()));
    }

    #[test]
    fn test_explicit_dot_experiment_claims_nothing() {
        let jobs = jobs(&[(JobSpec::new("p", "a").with_experiment("./"), JobState::Running)]);
        let view = build_view(&config(), jobs, empty_pool(), &records(&["runs/a"]));
        assert!(view.entry("p/runs/a").unwrap().job.is_none());
        assert_eq!(view.entry("p/job-1").unwrap().source, EntrySource::Job);
    }

    #[test]
    fn test_prefix_is_path_based() {
        // "runs/a" must not claim "runs/ab".
        let jobs = jobs(&[(JobSpec::new("p", "a").with_experiment("runs/a"), JobState::Running)]);
        let view = build_view(&config(), jobs, empty_pool(), &records(&["runs/ab"]));
        assert!(view.entry("p/runs/ab").unwrap().job.is_none());
    }
}
