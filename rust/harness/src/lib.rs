#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

//! ailab coordinator
//!
//! Schedules shell jobs onto an allowlisted set of GPUs, supervises their
//! processes, follows experiment directories for progress and metrics, and
//! serves a merged status view of both.

pub mod aggregator;
pub mod config;
pub mod experiment;
pub mod gpu_pool;
pub mod intake;
pub mod job;
pub mod lab;
pub mod load;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod tail;
pub mod watcher;

pub use aggregator::{EntrySource, StatusEntry, StatusView};
pub use experiment::ExperimentRecord;
pub use gpu_pool::{GpuPool, PoolError};
pub use job::{ExitOutcome, Job, JobId, JobSpec, JobState};
pub use lab::{Lab, LabError};
pub use load::{GpuLoad, ServerLoad};
pub use scheduler::{CancelError, CancelOutcome, SubmitError};
pub use state::StateManager;
pub use watcher::Watcher;
