//! Doubles for the collaborators of a source task, for use in tests.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

use crate::{
    BoxError, SourceRecord,
    bridge::BridgeProducer,
    event::{Acknowledge, ChangeEvent, Message, MessageBuffer, MessageKind},
    handler::{Filter, OutputRecord, SourceHandler, SourceHandlerParams},
    offsets::{HostMap, OffsetCodec, OffsetStorageReader, PartitionPosition},
    reader::{ChangeStreamReader, JoinStatus, ReaderContext, ReaderFactory},
};

/// Counts buffer releases and acknowledgements of the events it created.
#[derive(Debug, Clone, Default)]
pub struct ReleaseCounter {
    released: Arc<AtomicUsize>,
    acked: Arc<AtomicUsize>,
}

impl ReleaseCounter {
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn buffer(&self) -> Box<dyn MessageBuffer> {
        Box::new(CountingBuffer {
            released: Arc::clone(&self.released),
            failure: None,
        })
    }

    /// A buffer whose release is counted but fails.
    pub fn failing_buffer(&self) -> Box<dyn MessageBuffer> {
        self.failing_buffer_with("simulated release failure".to_string())
    }

    fn failing_buffer_with(&self, failure: String) -> Box<dyn MessageBuffer> {
        Box::new(CountingBuffer {
            released: Arc::clone(&self.released),
            failure: Some(failure),
        })
    }

    pub fn ack(&self) -> Box<dyn Acknowledge> {
        Box::new(CountingAck {
            acked: Arc::clone(&self.acked),
        })
    }
}

#[derive(Debug)]
struct CountingBuffer {
    released: Arc<AtomicUsize>,
    failure: Option<String>,
}

impl MessageBuffer for CountingBuffer {
    fn release(&mut self) -> Result<(), BoxError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(failure) => Err(failure.clone().into()),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct CountingAck {
    acked: Arc<AtomicUsize>,
}

impl Acknowledge for CountingAck {
    fn ack(&self, _message: &Message) {
        self.acked.fetch_add(1, Ordering::SeqCst);
    }
}

/// An event for document `doc-<seqno>`, streamed under vbucket UUID `1000 + partition`.
pub fn event(
    counter: &ReleaseCounter,
    kind: MessageKind,
    partition: u16,
    seqno: u64,
) -> ChangeEvent {
    event_with_buffer(counter, counter.buffer(), kind, partition, seqno)
}

pub fn mutation(counter: &ReleaseCounter, partition: u16, seqno: u64) -> ChangeEvent {
    event(counter, MessageKind::Mutation, partition, seqno)
}

/// A mutation whose buffer fails to release.
pub fn failing_mutation(counter: &ReleaseCounter, partition: u16, seqno: u64) -> ChangeEvent {
    let buffer =
        counter.failing_buffer_with(format!("simulated release failure for seqno {seqno}"));
    event_with_buffer(counter, buffer, MessageKind::Mutation, partition, seqno)
}

fn event_with_buffer(
    counter: &ReleaseCounter,
    buffer: Box<dyn MessageBuffer>,
    kind: MessageKind,
    partition: u16,
    seqno: u64,
) -> ChangeEvent {
    let content = if kind.is_removal() {
        String::new()
    } else {
        format!(r#"{{"seqno":{seqno}}}"#)
    };
    let message = Message::new(
        kind,
        partition,
        seqno,
        format!("doc-{seqno}"),
        content,
        buffer,
    );
    ChangeEvent::new(message, 1000 + u64::from(partition), counter.ack())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DropAllHandler;

impl SourceHandler for DropAllHandler {
    fn handle(&self, _params: SourceHandlerParams<'_>) -> Result<Option<OutputRecord>, BoxError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailingFilter;

impl Filter for FailingFilter {
    fn pass(&self, _message: &Message) -> Result<bool, BoxError> {
        Err("filter exploded".into())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FailingHandler;

impl SourceHandler for FailingHandler {
    fn handle(&self, _params: SourceHandlerParams<'_>) -> Result<Option<OutputRecord>, BoxError> {
        Err("handler exploded".into())
    }
}

/// Properties of a task streaming partitions 0-3 of bucket `travel`, with `overrides` applied.
pub fn properties(overrides: &[(&str, &str)]) -> HashMap<String, String> {
    [
        ("name", "travel-source"),
        ("couchbase.bucket", "travel"),
        ("couchbase.topic", "travel-topic"),
        ("couchbase.partitions", "0,1,2,3"),
    ]
    .into_iter()
    .chain(overrides.iter().copied())
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Offset storage backed by a list of committed (partition, offset) pairs.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: Mutex<Vec<(HostMap, HostMap)>>,
}

impl MemoryOffsetStore {
    pub fn commit(&self, codec: &OffsetCodec, partition: u16, position: PartitionPosition) {
        self.commit_raw(
            codec.source_partition(partition),
            OffsetCodec::source_offset(&position),
        );
    }

    /// Commit the position of a record the way Kafka Connect does once it was written.
    pub fn commit_record(&self, record: &SourceRecord) {
        self.commit_raw(record.source_partition.clone(), record.source_offset.clone());
    }

    pub fn commit_raw(&self, partition: HostMap, offset: HostMap) {
        let mut offsets = self.offsets.lock();
        match offsets.iter_mut().find(|(p, _)| *p == partition) {
            Some((_, existing)) => *existing = offset,
            None => offsets.push((partition, offset)),
        }
    }
}

impl OffsetStorageReader for MemoryOffsetStore {
    fn offsets(&self, partitions: &[HostMap]) -> Vec<(HostMap, Option<HostMap>)> {
        let offsets = self.offsets.lock();
        partitions
            .iter()
            .map(|requested| {
                let offset = offsets
                    .iter()
                    .find(|(p, _)| p == requested)
                    .map(|(_, o)| o.clone());
                (requested.clone(), offset)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderBehaviour {
    Cooperative,
    /// Never terminates when asked to.
    Stubborn,
    /// Fails to start.
    Failing,
}

/// Records the context of every reader it starts. The readers produce nothing on their own;
/// tests push events through [`ScriptedReaderFactory::producer`].
#[derive(Debug)]
pub struct ScriptedReaderFactory {
    behaviour: ReaderBehaviour,
    contexts: Mutex<Vec<ReaderContext>>,
    shutdowns: Arc<AtomicUsize>,
}

impl Default for ScriptedReaderFactory {
    fn default() -> Self {
        Self::with_behaviour(ReaderBehaviour::Cooperative)
    }
}

impl ScriptedReaderFactory {
    fn with_behaviour(behaviour: ReaderBehaviour) -> Self {
        Self {
            behaviour,
            contexts: Default::default(),
            shutdowns: Default::default(),
        }
    }

    /// Readers that keep running after a shutdown request.
    pub fn stubborn() -> Self {
        Self::with_behaviour(ReaderBehaviour::Stubborn)
    }

    /// Fails every start.
    pub fn failing() -> Self {
        Self::with_behaviour(ReaderBehaviour::Failing)
    }

    pub fn contexts(&self) -> Vec<ReaderContext> {
        self.contexts.lock().clone()
    }

    /// The bridge of the most recently started reader.
    pub fn producer(&self) -> Option<BridgeProducer> {
        self.contexts.lock().last().map(|c| c.bridge.clone())
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl ReaderFactory for ScriptedReaderFactory {
    fn start(&self, context: ReaderContext) -> Result<Box<dyn ChangeStreamReader>, BoxError> {
        if self.behaviour == ReaderBehaviour::Failing {
            return Err("cluster unreachable".into());
        }
        self.contexts.lock().push(context);
        Ok(Box::new(ScriptedReader {
            stubborn: self.behaviour == ReaderBehaviour::Stubborn,
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

#[derive(Debug)]
struct ScriptedReader {
    stubborn: bool,
    shutdowns: Arc<AtomicUsize>,
}

impl ChangeStreamReader for ScriptedReader {
    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }

    fn join(&mut self, timeout: Duration) -> JoinStatus {
        if self.stubborn {
            std::thread::sleep(timeout);
            JoinStatus::StillRunning
        } else {
            JoinStatus::Finished
        }
    }
}
