//! GPU slot accounting.
//!
//! The pool only knows which allowlisted ids are free and which job holds the
//! others. It has no ordering policy: `acquire` grants if enough slots are
//! free at the instant of the call and fails fast otherwise.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use ailab_config::GpuId;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// A set of GPU ids granted to one job.
pub type GpuSet = BTreeSet<GpuId>;

/// Assignment state of one GPU slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Assigned(JobId),
}

/// Thread-safe pool of allowlisted GPU ids.
#[derive(Debug)]
pub struct GpuPool {
    slots: Mutex<BTreeMap<GpuId, SlotState>>,
}

impl GpuPool {
    /// Create a pool where every allowlisted id starts free.
    #[must_use]
    pub fn new(allowlist: impl IntoIterator<Item = GpuId>) -> Self {
        Self {
            slots: Mutex::new(
                allowlist
                    .into_iter()
                    .map(|id| (id, SlotState::Free))
                    .collect(),
            ),
        }
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<GpuId, SlotState>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of allowlisted GPUs.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots().len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|s| **s == SlotState::Free)
            .count()
    }

    /// Reserve `count` free slots for `job`, lowest ids first. No partial grants.
    pub fn acquire(&self, job: JobId, count: usize) -> Result<GpuSet, PoolError> {
        let mut slots = self.slots();

        let free: Vec<GpuId> = slots
            .iter()
            .filter(|(_, s)| **s == SlotState::Free)
            .map(|(id, _)| *id)
            .take(count)
            .collect();

        if free.len() < count {
            let available = slots.values().filter(|s| **s == SlotState::Free).count();
            return Err(PoolError::Unavailable {
                requested: count,
                free: available,
            });
        }

        for id in &free {
            slots.insert(*id, SlotState::Assigned(job));
        }

        if !free.is_empty() {
            tracing::debug!(%job, gpus = ?free, "acquired GPUs");
        }
        Ok(free.into_iter().collect())
    }

    /// Assign exactly `gpus` to `job`. Used when re-adopting a process that
    /// survived a restart.
    pub fn claim(&self, job: JobId, gpus: &GpuSet) -> Result<(), PoolError> {
        let mut slots = self.slots();

        for id in gpus {
            match slots.get(id) {
                None => return Err(PoolError::Unknown(*id)),
                Some(SlotState::Assigned(owner)) if *owner != job => {
                    return Err(PoolError::Conflict {
                        gpu: *id,
                        owner: *owner,
                    });
                }
                Some(_) => {}
            }
        }

        for id in gpus {
            slots.insert(*id, SlotState::Assigned(job));
        }
        Ok(())
    }

    /// Return `gpus` held by `job` to the pool.
    ///
    /// The whole release is rejected if any id is unknown, already free, or
    /// held by another job: those are consistency faults, never user errors.
    pub fn release(&self, job: JobId, gpus: &GpuSet) -> Result<(), PoolError> {
        let mut slots = self.slots();

        for id in gpus {
            match slots.get(id) {
                None => return Err(PoolError::Unknown(*id)),
                Some(SlotState::Free) => return Err(PoolError::NotAssigned(*id)),
                Some(SlotState::Assigned(owner)) if *owner != job => {
                    return Err(PoolError::WrongOwner {
                        gpu: *id,
                        owner: *owner,
                        job,
                    });
                }
                Some(SlotState::Assigned(_)) => {}
            }
        }

        for id in gpus {
            slots.insert(*id, SlotState::Free);
        }

        if !gpus.is_empty() {
            tracing::debug!(%job, ?gpus, "released GPUs");
        }
        Ok(())
    }

    /// Free every slot held by `job`, whatever the caller believes it holds.
    pub fn reclaim(&self, job: JobId) -> GpuSet {
        let mut slots = self.slots();
        let mut freed = GpuSet::new();
        for (id, state) in slots.iter_mut() {
            if *state == SlotState::Assigned(job) {
                *state = SlotState::Free;
                freed.insert(*id);
            }
        }
        freed
    }

    /// GPUs currently held by `job`.
    #[must_use]
    pub fn held_by(&self, job: JobId) -> GpuSet {
        self.slots()
            .iter()
            .filter(|(_, s)| **s == SlotState::Assigned(job))
            .map(|(id, _)| *id)
            .collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let slots = self.slots();
        let mut snapshot = PoolSnapshot {
            total: slots.len(),
            free: Vec::new(),
            assigned: BTreeMap::new(),
        };
        for (id, state) in slots.iter() {
            match state {
                SlotState::Free => snapshot.free.push(*id),
                SlotState::Assigned(job) => {
                    snapshot.assigned.insert(*id, *job);
                }
            }
        }
        snapshot
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub free: Vec<GpuId>,
    pub assigned: BTreeMap<GpuId, JobId>,
}

/// Errors returned by the GPU pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("{requested} GPUs requested but only {free} free")]
    Unavailable { requested: usize, free: usize },
    #[error("gpu {0} is not in the allowlist")]
    Unknown(GpuId),
    #[error("gpu {0} is not assigned")]
    NotAssigned(GpuId),
    #[error("gpu {gpu} is held by {owner}, not {job}")]
    WrongOwner { gpu: GpuId, owner: JobId, job: JobId },
    #[error("gpu {gpu} is already held by {owner}")]
    Conflict { gpu: GpuId, owner: JobId },
}

impl PoolError {
    /// Whether this error means the pool and the job table disagree.
    #[must_use]
    pub fn is_consistency_fault(&self) -> bool {
        !matches!(self, Self::Unavailable { .. })
    }
}
