//! The Kafka Connect facing source task: `start`, `poll` and `stop`.
use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use cbkafka_clap_blocks::source::SourceTaskConfig;
use observability_deps::tracing::{error, info, warn};

use crate::{
    Error,
    batch::{BatchAssembler, DEQUEUE_WAIT},
    bridge::EventBridge,
    event::ChangeEvent,
    handler::{HandlerRegistry, SchemaAndValue},
    offsets::{HostMap, OffsetCodec, OffsetStorageReader},
    pipeline::Pipeline,
    reader::{ChangeStreamReader, JoinStatus, ReaderContext, ReaderFactory},
    redaction::{redact_user, set_redaction_level},
};

/// How long `stop` waits for the reader to terminate.
pub const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Granularity of the reader join, between which the fault slot is cleared.
const JOIN_SLICE: Duration = Duration::from_millis(10);

/// A record ready to be handed to Kafka Connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub source_partition: HostMap,
    pub source_offset: HostMap,
    pub topic: String,
    pub kafka_partition: Option<i32>,
    pub key: Option<SchemaAndValue>,
    pub value: Option<SchemaAndValue>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Created, never started.
    New,
    Starting,
    Running,
    Stopping,
    /// Terminal. A stopped task can't be started again.
    Stopped,
}

impl Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Collaborators the framework provides to a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub offset_storage: Arc<dyn OffsetStorageReader>,
    pub reader_factory: Arc<dyn ReaderFactory>,
    pub registry: HandlerRegistry,
    pub dequeue_wait: Duration,
    pub reader_join_timeout: Duration,
}

impl TaskContext {
    pub fn new(
        offset_storage: Arc<dyn OffsetStorageReader>,
        reader_factory: Arc<dyn ReaderFactory>,
    ) -> Self {
        Self {
            offset_storage,
            reader_factory,
            registry: HandlerRegistry::default(),
            dequeue_wait: DEQUEUE_WAIT,
            reader_join_timeout: READER_JOIN_TIMEOUT,
        }
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_dequeue_wait(mut self, dequeue_wait: Duration) -> Self {
        self.dequeue_wait = dequeue_wait;
        self
    }

    pub fn with_reader_join_timeout(mut self, reader_join_timeout: Duration) -> Self {
        self.reader_join_timeout = reader_join_timeout;
        self
    }
}

/// Clears the running flag of a task from another thread, making a blocked `poll` return.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn signal(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Streams one set of partitions of a bucket into Kafka Connect.
#[derive(Debug)]
pub struct SourceTask {
    context: TaskContext,
    state: TaskState,
    running: Arc<AtomicBool>,
    bridge: Option<EventBridge>,
    reader: Option<Box<dyn ChangeStreamReader>>,
    assembler: Option<BatchAssembler>,
}

impl SourceTask {
    pub fn new(context: TaskContext) -> Self {
        Self {
            context,
            state: TaskState::New,
            running: Arc::new(AtomicBool::new(false)),
            bridge: None,
            reader: None,
            assembler: None,
        }
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.running))
    }

    /// Parse the configuration, resolve saved offsets and launch the reader.
    ///
    /// On failure the task stays unusable; `stop` still cleans up whatever was set up.
    pub fn start(&mut self, properties: &HashMap<String, String>) -> Result<(), Error> {
        if self.state != TaskState::New {
            return Err(Error::AlreadyStarted(self.state));
        }
        self.state = TaskState::Starting;

        let config = Arc::new(SourceTaskConfig::from_properties(properties)?);
        set_redaction_level(config.log_redaction);

        let registry = &self.context.registry;
        let filter = config
            .event_filter
            .as_deref()
            .map(|name| registry.filter(name))
            .transpose()?;
        let handler = registry.source_handler(&config.source_handler)?;

        let connector = config
            .connector_name_in_offsets
            .then(|| config.name.clone());
        let codec = OffsetCodec::new(config.bucket.clone(), connector);
        let resume_positions =
            codec.read_positions(self.context.offset_storage.as_ref(), &config.partitions)?;

        self.assembler = Some(
            BatchAssembler::new(
                Pipeline::new(filter, handler, config.bucket.clone(), config.topic.clone()),
                codec,
                config.batch_size_max,
            )
            .with_dequeue_wait(self.context.dequeue_wait),
        );

        self.running.store(true, Ordering::Release);
        let bridge = EventBridge::new();
        let reader_context = ReaderContext {
            task_name: config.name.clone(),
            config: Arc::clone(&config),
            properties: properties.clone(),
            bridge: bridge.producer(),
            partitions: config.partitions.clone(),
            resume_positions,
        };
        self.bridge = Some(bridge);
        self.reader = Some(
            self.context
                .reader_factory
                .start(reader_context)
                .map_err(Error::ReaderStart)?,
        );

        self.state = TaskState::Running;
        info!(
            task = %config.name,
            bucket = %config.bucket,
            topic = %config.topic,
            partitions = config.partitions.len(),
            "source task started"
        );
        Ok(())
    }

    /// Return the next batch of records; see [`BatchAssembler::poll`].
    pub fn poll(&mut self) -> Result<Vec<SourceRecord>, Error> {
        match (self.state, &self.assembler, &self.bridge) {
            (TaskState::Running, Some(assembler), Some(bridge)) => {
                assembler.poll(bridge, &self.running)
            }
            _ => Err(Error::NotRunning(self.state)),
        }
    }

    /// Convert a single event outside of the batching loop. Acknowledges and releases it.
    pub fn convert(&self, event: ChangeEvent) -> Result<Option<SourceRecord>, Error> {
        match &self.assembler {
            Some(assembler) => assembler.process(event),
            None => Err(Error::NotRunning(self.state)),
        }
    }

    /// Stop the reader and release every event still waiting in the bridge.
    ///
    /// Safe to call at any time and any number of times. Leftover events are released without
    /// being acknowledged since the stream is already closed. If releasing fails, the remaining
    /// events are still released and the first failure is returned.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.running.store(false, Ordering::Release);
        if self.state != TaskState::Stopped {
            self.state = TaskState::Stopping;
        }

        if let Some(mut reader) = self.reader.take() {
            reader.shutdown();
            let status = join_reader(
                reader.as_mut(),
                self.bridge.as_ref(),
                self.context.reader_join_timeout,
            );
            if status == JoinStatus::StillRunning {
                error!(
                    timeout = ?self.context.reader_join_timeout,
                    "reader thread is still alive after shutdown request"
                );
            }
        }

        let result = match self.bridge.take() {
            Some(bridge) => {
                let events = bridge.drain();
                info!(n = events.len(), "releasing unconsumed events");
                release_all(events)
            }
            None => Ok(()),
        };

        self.assembler = None;
        self.state = TaskState::Stopped;
        result
    }
}

/// Join the reader, discarding faults it reports meanwhile so it can't stay blocked on a full
/// fault slot.
fn join_reader(
    reader: &mut dyn ChangeStreamReader,
    bridge: Option<&EventBridge>,
    timeout: Duration,
) -> JoinStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(bridge) = bridge {
            while let Some(fault) = bridge.poll_fault() {
                warn!(%fault, "discarding reader fault reported during shutdown");
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let status = reader.join(remaining.min(JOIN_SLICE));
        if status == JoinStatus::Finished || remaining.is_zero() {
            return status;
        }
    }
}

fn release_all(events: Vec<ChangeEvent>) -> Result<(), Error> {
    let mut deferred = None;
    for mut event in events {
        if let Err(e) = event.release() {
            warn!(
                error = %e,
                partition = event.message().partition(),
                by_seqno = event.message().by_seqno(),
                key = %redact_user(String::from_utf8_lossy(event.message().key())),
                "failed to release buffer"
            );
            deferred.get_or_insert(e);
        }
    }
    match deferred {
        Some(e) => Err(Error::Release(e)),
        None => Ok(()),
    }
}
