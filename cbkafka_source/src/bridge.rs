//! Hand-off between the stream reader thread and the thread polling the task.
//!
//! The [`EventBridge`] is owned by the task. The reader receives a [`BridgeProducer`] through
//! which it enqueues events and reports faults it cannot recover from:
//!
//! ```text
//!   reader thread(s)                         poll thread
//!  ┌────────────────┐  enqueue     ┌──────────────────────────┐
//!  │ BridgeProducer │ ───────────► │ events (unbounded, FIFO) │ ──► dequeue_timeout / drain
//!  │                │  push_fault  ├──────────────────────────┤
//!  │                │ ───────────► │ fault slot (capacity 1)  │ ──► poll_fault
//!  └────────────────┘              └──────────────────────────┘
//! ```
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::{BoxError, event::ChangeEvent};

/// An unrecoverable condition reported by the reader.
pub type Fault = BoxError;

/// The receiving side of the bridge is gone; hands the rejected value back to the caller.
#[derive(Debug, Error)]
#[error("event bridge is closed")]
pub struct BridgeClosed<T>(pub T);

#[derive(Debug)]
pub struct EventBridge {
    events_tx: Sender<ChangeEvent>,
    events_rx: Receiver<ChangeEvent>,
    faults_tx: Sender<Fault>,
    faults_rx: Receiver<Fault>,
}

impl EventBridge {
    pub fn new() -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (faults_tx, faults_rx) = crossbeam_channel::bounded(1);
        Self {
            events_tx,
            events_rx,
            faults_tx,
            faults_rx,
        }
    }

    /// A handle for the reader. Can be cloned for readers running several threads.
    pub fn producer(&self) -> BridgeProducer {
        BridgeProducer {
            events_tx: self.events_tx.clone(),
            faults_tx: self.faults_tx.clone(),
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            // the bridge holds a sender itself, so the channel can't disconnect
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take the outstanding fault, if any, without blocking.
    pub fn poll_fault(&self) -> Option<Fault> {
        self.faults_rx.try_recv().ok()
    }

    /// Take every event currently resident in the bridge.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        self.events_rx.try_iter().collect()
    }

    /// Number of events waiting to be dequeued.
    pub fn len(&self) -> usize {
        self.events_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events_rx.is_empty()
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// The reader's end of an [`EventBridge`].
#[derive(Debug, Clone)]
pub struct BridgeProducer {
    events_tx: Sender<ChangeEvent>,
    faults_tx: Sender<Fault>,
}

impl BridgeProducer {
    /// Enqueue an event. Never blocks.
    ///
    /// Fails only once the task dropped the bridge, in which case the caller gets the event back
    /// and remains responsible for releasing it.
    pub fn enqueue(&self, event: ChangeEvent) -> Result<(), BridgeClosed<ChangeEvent>> {
        self.events_tx
            .send(event)
            .map_err(|e| BridgeClosed(e.into_inner()))
    }

    /// Report a fatal fault to the task.
    ///
    /// Blocks while a previous fault has not been picked up yet. A reader seeing this block should
    /// treat it as a signal to stop producing.
    pub fn push_fault(&self, fault: Fault) -> Result<(), BridgeClosed<Fault>> {
        self.faults_tx
            .send(fault)
            .map_err(|e| BridgeClosed(e.into_inner()))
    }

    /// Report a fault only if the slot is free. Returns the fault if the slot is occupied or the
    /// bridge is closed.
    pub fn try_push_fault(&self, fault: Fault) -> Result<(), BridgeClosed<Fault>> {
        self.faults_tx.try_send(fault).map_err(|e| match e {
            TrySendError::Full(f) | TrySendError::Disconnected(f) => BridgeClosed(f),
        })
    }
}
