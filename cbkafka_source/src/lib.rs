//! Bridges a Couchbase change stream (DCP) to the pull based source task API of Kafka Connect.
//!
//! A stream reader running on its own thread pushes [`ChangeEvent`](event::ChangeEvent)s into an
//! [`EventBridge`](bridge::EventBridge). Each [`SourceTask::poll`] drains the bridge into a batch,
//! running every event through the configured filter and source handler, and attaches the
//! source partition and offset Kafka Connect needs to resume the stream after a restart.
//!
//! The task guarantees that
//!
//! * `poll` never blocks longer than one dequeue wait once the stream went idle, and never returns
//!   more records than `couchbase.batch.size.max`;
//! * every event buffer is released exactly once, whether it was converted, filtered out, failed
//!   conversion, or was still queued when the task stopped;
//! * a fault reported by the reader fails the next `poll`.
use thiserror::Error;

use cbkafka_clap_blocks::source::ConfigError;

pub mod batch;
pub mod bridge;
pub mod event;
pub mod handler;
pub mod offsets;
pub mod pipeline;
pub mod reader;
pub mod redaction;
pub mod task;
pub mod test_utils;

pub use task::{SourceRecord, SourceTask, StopHandle, TaskContext, TaskState};

/// Boxed error for collaborator supplied failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("couldn't start source task due to configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("couldn't read saved source offsets: {0}")]
    Offsets(#[from] offsets::OffsetError),

    #[error("couldn't start change stream reader: {0}")]
    ReaderStart(#[source] BoxError),

    #[error(transparent)]
    Pipeline(#[from] pipeline::PipelineError),

    #[error("change stream reader failed: {0}")]
    Fatal(#[source] bridge::Fault),

    #[error(transparent)]
    Release(#[from] event::ReleaseError),

    #[error("source task is not running (state: {0})")]
    NotRunning(TaskState),

    #[error("source task can't be started again (state: {0})")]
    AlreadyStarted(TaskState),
}

impl Error {
    /// Whether the task must fail. Everything but calling the task in the wrong state is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotRunning(_) | Self::AlreadyStarted(_))
    }
}
