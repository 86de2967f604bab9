//! The contract with the stream reader that feeds the task.
//!
//! The reader connects to the cluster, streams the partitions it was given and pushes the events
//! into the task's [`EventBridge`](crate::bridge::EventBridge) through a [`BridgeProducer`].
//! [`ThreadedReader`] is a ready-made host for readers that run on a dedicated thread.
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use cbkafka_clap_blocks::source::SourceTaskConfig;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use observability_deps::tracing::{error, info};
use tokio_util::sync::CancellationToken;

use crate::{BoxError, bridge::BridgeProducer, offsets::PartitionPosition};

/// Everything a reader needs to start streaming.
#[derive(Debug, Clone)]
pub struct ReaderContext {
    pub task_name: String,
    pub config: Arc<SourceTaskConfig>,
    /// The task's raw properties, for settings only the reader understands.
    pub properties: HashMap<String, String>,
    pub bridge: BridgeProducer,
    pub partitions: Vec<u16>,
    /// Saved positions; partitions without an entry start from the reader's default position.
    pub resume_positions: BTreeMap<u16, PartitionPosition>,
}

/// Starts a reader for a task.
pub trait ReaderFactory: Debug + Send + Sync {
    fn start(&self, context: ReaderContext) -> Result<Box<dyn ChangeStreamReader>, BoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Finished,
    StillRunning,
}

/// A running reader.
///
/// Once [`shutdown`](Self::shutdown) was called the reader must stop enqueuing events.
pub trait ChangeStreamReader: Debug + Send {
    fn shutdown(&self);

    /// Wait at most `timeout` for the reader to terminate.
    fn join(&mut self, timeout: Duration) -> JoinStatus;
}

/// Runs a reader loop on a dedicated, named thread.
#[derive(Debug)]
pub struct ThreadedReader {
    shutdown: CancellationToken,
    /// Disconnects when the thread exits, including by panic.
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedReader {
    /// Spawn `run` on a new thread. `run` must return once the token is cancelled.
    pub fn spawn<F>(name: impl Into<String>, run: F) -> std::io::Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let name = name.into();
        let shutdown = CancellationToken::new();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let token = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done = done_tx;
                run(token);
            })?;
        info!(%name, "reader thread started");

        Ok(Self {
            shutdown,
            done_rx,
            handle: Some(handle),
        })
    }

    /// A token that is cancelled once shutdown was requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl ChangeStreamReader for ThreadedReader {
    fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn join(&mut self, timeout: Duration) -> JoinStatus {
        let Some(handle) = self.handle.take() else {
            return JoinStatus::Finished;
        };

        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                self.handle = Some(handle);
                JoinStatus::StillRunning
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("reader thread panicked");
                }
                JoinStatus::Finished
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_shutdown_and_join() {
        let mut reader = ThreadedReader::spawn("test-reader", |token| {
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
        })
        .unwrap();

        assert_eq!(
            reader.join(Duration::from_millis(20)),
            JoinStatus::StillRunning
        );
        assert!(!reader.shutdown_token().is_cancelled());

        reader.shutdown();
        assert_eq!(reader.join(Duration::from_secs(5)), JoinStatus::Finished);
        // joining again is a no-op
        assert_eq!(reader.join(Duration::ZERO), JoinStatus::Finished);
    }

    #[test]
    fn test_join_times_out() {
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        // ignores the shutdown request until told otherwise
        let mut reader = ThreadedReader::spawn("stubborn-reader", move |_token| {
            let _ = release_rx.recv();
        })
        .unwrap();

        reader.shutdown();
        let start = Instant::now();
        assert_eq!(
            reader.join(Duration::from_millis(30)),
            JoinStatus::StillRunning
        );
        assert!(start.elapsed() >= Duration::from_millis(30));

        drop(release_tx);
        assert_eq!(reader.join(Duration::from_secs(5)), JoinStatus::Finished);
    }

    #[test]
    fn test_panicking_reader_finishes() {
        let mut reader = ThreadedReader::spawn("panicking-reader", |_token| {
            panic!("lost connection");
        })
        .unwrap();
        assert_eq!(reader.join(Duration::from_secs(5)), JoinStatus::Finished);
    }
}
