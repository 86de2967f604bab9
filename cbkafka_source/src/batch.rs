//! Assembles batches of records for one `poll` of the task.
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use observability_deps::tracing::{info, warn};

use crate::{
    Error,
    bridge::EventBridge,
    event::{ChangeEvent, ReleaseError},
    offsets::OffsetCodec,
    pipeline::{Converted, Pipeline},
    redaction::redact_user,
    task::SourceRecord,
};

/// How long a poll waits for the next event before treating the stream as idle.
pub const DEQUEUE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct BatchAssembler {
    pipeline: Pipeline,
    codec: OffsetCodec,
    batch_size_max: NonZeroUsize,
    dequeue_wait: Duration,
}

impl BatchAssembler {
    pub fn new(pipeline: Pipeline, codec: OffsetCodec, batch_size_max: NonZeroUsize) -> Self {
        Self {
            pipeline,
            codec,
            batch_size_max,
            dequeue_wait: DEQUEUE_WAIT,
        }
    }

    pub fn with_dequeue_wait(mut self, dequeue_wait: Duration) -> Self {
        self.dequeue_wait = dequeue_wait;
        self
    }

    /// Collect the next batch.
    ///
    /// Returns as soon as the batch is full, or once the bridge stayed empty for one dequeue wait
    /// after at least one record was collected. An empty batch is only returned when `running`
    /// is cleared. A fault reported by the reader fails the call and discards the partial batch.
    pub fn poll(
        &self,
        bridge: &EventBridge,
        running: &AtomicBool,
    ) -> Result<Vec<SourceRecord>, Error> {
        let mut results = Vec::new();
        // counts processed events, whether or not they produced a record
        let mut remaining = self.batch_size_max.get();

        while running.load(Ordering::Acquire) {
            let event = bridge.dequeue_timeout(self.dequeue_wait);
            let idle = event.is_none();

            if let Some(event) = event {
                if let Some(record) = self.process(event)? {
                    results.push(record);
                }
                remaining = remaining.saturating_sub(1);
            }

            if !results.is_empty() && (remaining == 0 || idle) {
                info!(n = results.len(), "poll returns result(s)");
                return Ok(results);
            }

            if let Some(fault) = bridge.poll_fault() {
                return Err(Error::Fatal(fault));
            }
        }

        Ok(results)
    }

    /// Convert one event into a host record. The event is acknowledged only if conversion
    /// succeeded, and released on every path.
    pub fn process(&self, event: ChangeEvent) -> Result<Option<SourceRecord>, Error> {
        let mut in_flight = InFlight(event);
        let event = in_flight.event();

        let converted = self.pipeline.process(event)?;
        event.ack();
        let record = converted.map(|c| self.to_source_record(c));

        in_flight.release()?;
        Ok(record)
    }

    fn to_source_record(&self, converted: Converted) -> SourceRecord {
        let Converted {
            partition,
            position,
            record,
        } = converted;
        SourceRecord {
            source_partition: self.codec.source_partition(partition),
            source_offset: OffsetCodec::source_offset(&position),
            topic: record
                .topic
                .unwrap_or_else(|| self.pipeline.topic().to_string()),
            kafka_partition: record.kafka_partition,
            key: record.key,
            value: record.value,
            timestamp: record.timestamp,
        }
    }
}

/// Owns an event while it is processed and releases it when dropped, so early returns and
/// panics in a collaborator can't leak the buffer.
struct InFlight(ChangeEvent);

impl InFlight {
    fn event(&self) -> &ChangeEvent {
        &self.0
    }

    /// Release explicitly to observe the outcome. Dropping afterwards is a no-op.
    fn release(&mut self) -> Result<(), ReleaseError> {
        self.0.release()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Err(e) = self.0.release() {
            warn!(
                error = %e,
                key = %redact_user(String::from_utf8_lossy(self.0.message().key())),
                "failed to release buffer"
            );
        }
    }
}
