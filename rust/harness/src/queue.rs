//! In-memory job table and pending queue.
//!
//! One mutex guards the whole table and is held only for in-memory updates.
//! Every update bumps a version counter so the journal writer and status
//! subscribers learn about changes without polling.
//!
//! Lock order: the table lock is taken before the GPU pool lock, never the
//! other way around.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;

use crate::{
    gpu_pool::{GpuPool, PoolError},
    job::{Job, JobId, JobSpec, JobState},
    state::{Journal, now_timestamp},
};

/// Jobs by id plus the ordered queue of pending ids.
#[derive(Debug)]
pub struct TableInner {
    jobs: BTreeMap<JobId, Job>,
    /// Pending ids ordered by priority (descending), then submission order.
    pending: Vec<JobId>,
    next_id: u64,
}

impl Default for TableInner {
    fn default() -> Self {
        Self {
            jobs: BTreeMap::new(),
            pending: Vec::new(),
            next_id: 1,
        }
    }
}

impl TableInner {
    /// Rebuild the table from a journal. Pending order is recomputed from
    /// priorities and ids, which encode submission order.
    #[must_use]
    pub fn from_journal(journal: Journal) -> Self {
        let jobs: BTreeMap<JobId, Job> = journal.jobs.into_iter().map(|j| (j.id, j)).collect();
        let max_id = jobs.keys().next_back().map_or(0, |id| id.0);

        let mut pending: Vec<JobId> = jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .map(|j| j.id)
            .collect();
        pending.sort_by_key(|id| (std::cmp::Reverse(jobs[id].spec.priority), *id));

        Self {
            jobs,
            pending,
            next_id: journal.next_id.max(max_id + 1),
        }
    }

    #[must_use]
    pub fn to_journal(&self) -> Journal {
        Journal {
            next_id: self.next_id,
            jobs: self.jobs.values().cloned().collect(),
            ..Journal::default()
        }
    }

    /// Add a new pending job behind every job of equal or higher priority.
    pub fn enqueue(&mut self, spec: JobSpec, workdir: PathBuf, jobs_dir: &Path) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;

        let priority = spec.priority;
        let job = Job {
            id,
            spec,
            state: JobState::Pending,
            gpus: Default::default(),
            workdir,
            log_dir: jobs_dir.join(id.to_string()),
            pid: None,
            submitted_at: now_timestamp(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            outcome: None,
            error: None,
        };
        self.jobs.insert(id, job);

        let jobs = &self.jobs;
        let at = self
            .pending
            .partition_point(|other| jobs.get(other).is_some_and(|j| j.spec.priority >= priority));
        self.pending.insert(at, id);
        id
    }

    #[must_use]
    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Pending ids in scheduling order.
    #[must_use]
    pub fn pending(&self) -> &[JobId] {
        &self.pending
    }

    /// Drop a pending job from the queue and the table.
    pub fn remove_pending(&mut self, id: JobId) -> Option<Job> {
        let pos = self.pending.iter().position(|p| *p == id)?;
        self.pending.remove(pos);
        self.jobs.remove(&id)
    }

    /// Finished jobs beyond the newest `keep`, oldest first.
    #[must_use]
    pub fn retirable(&self, keep: usize) -> Vec<Job> {
        let finished: Vec<&Job> = self.jobs.values().filter(|j| j.state.is_terminal()).collect();
        let excess = finished.len().saturating_sub(keep);
        finished.into_iter().take(excess).cloned().collect()
    }

    /// Remove finished jobs from the table. Ids keep counting up.
    pub fn retire(&mut self, ids: &[JobId]) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|id, job| !(ids.contains(id) && job.state.is_terminal()));
        before - self.jobs.len()
    }

    /// Jobs currently holding GPUs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.jobs.values().filter(|j| j.state.is_active()).count()
    }

    /// Walk the queue head to tail granting GPUs.
    ///
    /// Stops at the first job that cannot be granted: a later, smaller job
    /// never overtakes an earlier one. Returns the jobs moved to `Scheduled`.
    pub fn plan(&mut self, pool: &GpuPool, max_active: Option<usize>) -> Vec<Job> {
        let mut active = self.active_count();
        let mut planned = Vec::new();

        while let Some(&id) = self.pending.first() {
            if max_active.is_some_and(|max| active >= max) {
                tracing::debug!(active, "concurrency limit reached");
                break;
            }

            let Some(job) = self.jobs.get_mut(&id) else {
                self.pending.remove(0);
                continue;
            };
            if job.state != JobState::Pending {
                tracing::warn!(job = %id, state = %job.state, "dropping non-pending job from queue");
                self.pending.remove(0);
                continue;
            }

            match pool.acquire(id, job.spec.gpus) {
                Ok(gpus) => {
                    if let Err(e) = job.transition(JobState::Scheduled) {
                        tracing::error!("{e}");
                        let _ = pool.release(id, &gpus);
                        break;
                    }
                    job.gpus = gpus;
                    self.pending.remove(0);
                    active += 1;
                    planned.push(job.clone());
                }
                Err(PoolError::Unavailable { requested, free }) => {
                    tracing::debug!(job = %id, requested, free, "head of queue waits for GPUs");
                    break;
                }
                Err(e) => {
                    tracing::error!(job = %id, "gpu pool fault while scheduling: {e}");
                    break;
                }
            }
        }

        planned
    }
}

/// Shared job table.
#[derive(Debug)]
pub struct JobTable {
    inner: Mutex<TableInner>,
    version: watch::Sender<u64>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new(TableInner::default())
    }
}

impl JobTable {
    #[must_use]
    pub fn new(inner: TableInner) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Mutex::new(inner),
            version,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutate the table under its lock and notify subscribers.
    pub fn update<R>(&self, f: impl FnOnce(&mut TableInner) -> R) -> R {
        self.update_if(f, |_| true)
    }

    /// Like [`JobTable::update`], but subscribers are only notified when
    /// `changed` holds for the result.
    pub fn update_if<R>(
        &self,
        f: impl FnOnce(&mut TableInner) -> R,
        changed: impl FnOnce(&R) -> bool,
    ) -> R {
        let result = {
            let mut inner = self.lock();
            f(&mut inner)
        };
        if changed(&result) {
            self.version.send_modify(|v| *v += 1);
        }
        result
    }

    /// Read the table under its lock.
    pub fn read<R>(&self, f: impl FnOnce(&TableInner) -> R) -> R {
        f(&self.lock())
    }

    #[must_use]
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.read(|t| t.get(id).cloned())
    }

    /// Clone of every job, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Job> {
        self.read(|t| t.jobs().cloned().collect())
    }

    /// Receiver that changes whenever the table is updated.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueue(table: &mut TableInner, gpus: usize, priority: i32) -> JobId {
        table.enqueue(
            JobSpec::new("p", "true")
                .with_gpus(gpus)
                .with_priority(priority),
            PathBuf::from("/tmp"),
            Path::new("/tmp/jobs"),
        )
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut table = TableInner::default();
        let a = enqueue(&mut table, 0, 0);
        let b = enqueue(&mut table, 0, 5);
        let c = enqueue(&mut table, 0, 0);
        let d = enqueue(&mut table, 0, 5);
        assert_eq!(table.pending(), &[b, d, a, c]);
        assert_eq!(table.get(a).unwrap().log_dir, PathBuf::from("/tmp/jobs/job-1"));
    }

    #[test]
    fn test_head_of_line_blocking() {
        // 4 GPUs, 2 already busy: [1, 4, 1] must schedule only the first.
        let pool = GpuPool::new([0, 1, 2, 3]);
        pool.acquire(JobId(99), 2).unwrap();

        let mut table = TableInner::default();
        let first = enqueue(&mut table, 1, 0);
        let big = enqueue(&mut table, 4, 0);
        let small = enqueue(&mut table, 1, 0);

        let planned = table.plan(&pool, None);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].id, first);
        assert_eq!(table.get(first).unwrap().state, JobState::Scheduled);
        assert_eq!(table.pending(), &[big, small]);
        assert_eq!(pool.free_count(), 1);

        // Freeing capacity lets the big job go first, then the small one waits.
        pool.reclaim(JobId(99));
        pool.release(first, &planned[0].gpus).unwrap();
        let planned = table.plan(&pool, None);
        assert_eq!(planned.iter().map(|j| j.id).collect::<Vec<_>>(), vec![big]);
        assert_eq!(table.pending(), &[small]);
    }

    #[test]
    fn test_concurrency_limit() {
        let pool = GpuPool::new([]);
        let mut table = TableInner::default();
        for _ in 0..3 {
            enqueue(&mut table, 0, 0);
        }
        assert_eq!(table.plan(&pool, Some(2)).len(), 2);
        assert_eq!(table.active_count(), 2);
        assert!(table.plan(&pool, Some(2)).is_empty());
        assert_eq!(table.pending().len(), 1);
    }

    #[test]
    fn test_remove_pending() {
        let mut table = TableInner::default();
        let a = enqueue(&mut table, 0, 0);
        assert!(table.remove_pending(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.remove_pending(a).is_none());
    }

    #[test]
    fn test_journal_preserves_ids_and_order() {
        let mut table = TableInner::default();
        let a = enqueue(&mut table, 0, 0);
        let b = enqueue(&mut table, 0, 3);
        let restored = TableInner::from_journal(table.to_journal());
        assert_eq!(restored.pending(), &[b, a]);

        let mut restored = restored;
        let c = enqueue(&mut restored, 0, 0);
        assert_eq!(c, JobId(3));
    }

    #[test]
    fn test_retire_keeps_newest_finished() {
        let mut table = TableInner::default();
        let ids: Vec<JobId> = (0..5).map(|_| enqueue(&mut table, 0, 0)).collect();
        for (id, state) in ids.iter().zip([
            JobState::Succeeded,
            JobState::Running,
            JobState::Failed,
            JobState::Killed,
            JobState::Succeeded,
        ]) {
            table.get_mut(*id).unwrap().state = state;
        }

        let old: Vec<JobId> = table.retirable(2).iter().map(|j| j.id).collect();
        assert_eq!(old, vec![ids[0], ids[2]]);
        assert_eq!(table.retire(&old), 2);
        // Active jobs are never retired, even when named.
        assert_eq!(table.retire(&[ids[1]]), 0);

        let left: Vec<JobId> = table.jobs().map(|j| j.id).collect();
        assert_eq!(left, vec![ids[1], ids[3], ids[4]]);
        assert!(table.retirable(2).is_empty());
        assert_eq!(enqueue(&mut table, 0, 0), JobId(6));
        assert_eq!(TableInner::from_journal(table.to_journal()).retirable(2).len(), 0);
    }

    #[test]
    fn test_update_bumps_version() {
        let table = JobTable::default();
        let rx = table.subscribe();
        table.update(|t| enqueue(t, 0, 0));
        assert!(rx.has_changed().unwrap());
        assert_eq!(table.snapshot().len(), 1);
    }

    #[test]
    fn test_blocked_plan_leaves_version_alone() {
        let pool = GpuPool::new([0]);
        let table = JobTable::default();
        table.update(|t| enqueue(t, 2, 0));
        let mut rx = table.subscribe();
        rx.mark_unchanged();

        let planned = table.update_if(|t| t.plan(&pool, None), |p| !p.is_empty());
        assert!(planned.is_empty());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(table.read(|t| t.pending().len()), 1);
    }
}
