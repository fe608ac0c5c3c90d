//! Wires the coordinator together and exposes its operations.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use ailab_config::{LabConfig, ValidationError};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    aggregator::{Aggregator, StatusUpdates, StatusView},
    gpu_pool::{GpuPool, PoolSnapshot},
    job::{ExitOutcome, Job, JobId, JobSpec},
    load::{LoadSampler, ServerLoad},
    queue::{JobTable, TableInner},
    runner::{ExecutionHost, ExitEvent},
    scheduler::{CancelError, CancelOutcome, Scheduler, SchedulerEvent, SubmitError},
    state::{Reconciliation, StateError, StateManager, is_process_alive, reconcile},
    watcher::{Records, Watcher},
};

/// A running coordinator.
pub struct Lab {
    config: Arc<LabConfig>,
    table: Arc<JobTable>,
    pool: Arc<GpuPool>,
    scheduler: Arc<Scheduler>,
    aggregator: Aggregator,
    events: mpsc::UnboundedSender<SchedulerEvent>,
    state: StateManager,
    scheduler_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Lab {
    /// Restore the journal, reconcile it with live processes and start the
    /// scheduler, journal and watcher tasks.
    pub async fn start(config: LabConfig) -> Result<Self, LabError> {
        config.validate()?;
        std::fs::create_dir_all(&config.workspace)
            .map_err(|e| LabError::Io(config.workspace.clone(), e))?;
        let config = Arc::new(config);

        let state = StateManager::new(config.state_file());
        let mut journal = state.load()?;
        let report = reconcile(&mut journal, is_process_alive);
        log_reconciliation(&report);

        let table = Arc::new(JobTable::new(TableInner::from_journal(journal)));
        let pool = Arc::new(GpuPool::new(config.gpus.iter().copied()));
        let (events, events_rx) = mpsc::unbounded_channel();
        let host = Arc::new(ExecutionHost::new(
            &config,
            table.clone(),
            pool.clone(),
            events.clone(),
        ));

        for id in &report.adopted {
            let Some(job) = table.get(*id) else {
                continue;
            };
            if let Err(e) = host.adopt(&job) {
                tracing::error!(job = %id, "cannot reclaim GPUs of adopted job: {e}");
                host.finalize(ExitEvent {
                    job: *id,
                    outcome: ExitOutcome::Lost {
                        reason: format!("GPUs unavailable after restart: {e}"),
                    },
                    stderr_tail: Vec::new(),
                });
            }
        }

        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            table.clone(),
            pool.clone(),
            host,
            events.clone(),
        ));
        scheduler.retire_finished();
        state.save_table(&table)?;

        let (records_tx, records_rx) = watch::channel::<Records>(Arc::new(BTreeMap::new()));
        let (load_tx, load_rx) = watch::channel::<Option<ServerLoad>>(None);
        let aggregator = Aggregator::new(
            config.clone(),
            table.clone(),
            pool.clone(),
            records_rx,
            load_rx,
        );

        let scheduler_task = tokio::spawn(scheduler.clone().run(events_rx));

        let mut background = vec![
            tokio::spawn(StateManager::new(config.state_file()).run(table.clone())),
            tokio::spawn(Watcher::new(&config).run(records_tx)),
        ];
        if config.watcher.sample_load {
            background.push(tokio::spawn(LoadSampler::new(&config).run(load_tx)));
        }

        tracing::info!(
            gpus = pool.capacity(),
            projects = config.projects.len(),
            "lab started"
        );

        Ok(Self {
            config,
            table,
            pool,
            scheduler,
            aggregator,
            events,
            state,
            scheduler_task,
            background,
        })
    }

    #[must_use]
    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn submit(&self, spec: JobSpec) -> Result<JobId, SubmitError> {
        self.scheduler.submit(spec)
    }

    pub fn cancel(&self, id: JobId) -> Result<CancelOutcome, CancelError> {
        self.scheduler.cancel(id)
    }

    #[must_use]
    pub fn job(&self, id: JobId) -> Option<Job> {
        self.table.get(id)
    }

    #[must_use]
    pub fn query(&self) -> StatusView {
        self.aggregator.query()
    }

    #[must_use]
    pub fn subscribe(&self) -> StatusUpdates {
        self.aggregator.subscribe()
    }

    #[must_use]
    pub fn pool(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Stop scheduling and write a final journal.
    ///
    /// Running processes are left alone; the next start adopts them.
    pub async fn shutdown(self) -> Result<(), LabError> {
        let _ = self.events.send(SchedulerEvent::Shutdown);
        if let Err(e) = self.scheduler_task.await {
            tracing::error!("scheduler task failed: {e}");
        }
        for task in &self.background {
            task.abort();
        }
        self.state.save_table(&self.table)?;
        tracing::info!("lab stopped");
        Ok(())
    }
}

fn log_reconciliation(report: &Reconciliation) {
    if report.adopted.is_empty() && report.lost.is_empty() && report.unlaunched.is_empty() {
        return;
    }
    tracing::warn!(
        adopted = report.adopted.len(),
        lost = report.lost.len(),
        unlaunched = report.unlaunched.len(),
        "reconciled jobs from previous run"
    );
}

/// Errors that prevent the lab from starting or stopping cleanly.
#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationError),
    #[error("journal error: {0}")]
    State(#[from] StateError),
    #[error("failed to create {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
