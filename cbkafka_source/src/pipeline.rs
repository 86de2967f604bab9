//! Filter, decorate and convert a single change event.
use thiserror::Error;

use crate::{
    BoxError,
    event::{ChangeEvent, DocumentEvent},
    handler::{Filter, OutputRecord, SourceHandler, SourceHandlerParams},
    offsets::PartitionPosition,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("event filter failed: {0}")]
    Filter(#[source] BoxError),

    #[error("source handler failed: {0}")]
    Handler(#[source] BoxError),
}

/// A record produced for an event, with the stream position it was produced at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converted {
    pub partition: u16,
    pub position: PartitionPosition,
    pub record: OutputRecord,
}

#[derive(Debug)]
pub struct Pipeline {
    filter: Option<Box<dyn Filter>>,
    handler: Box<dyn SourceHandler>,
    bucket: String,
    topic: String,
}

impl Pipeline {
    pub fn new(
        filter: Option<Box<dyn Filter>>,
        handler: Box<dyn SourceHandler>,
        bucket: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            filter,
            handler,
            bucket: bucket.into(),
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Run an event through the filter and the source handler.
    ///
    /// `Ok(None)` means the event was filtered out or dropped by the handler; it still counts as
    /// handled. Neither acknowledges nor releases the event.
    pub fn process(&self, event: &ChangeEvent) -> Result<Option<Converted>, PipelineError> {
        // the filter sees the raw message only
        if let Some(filter) = &self.filter {
            if !filter.pass(event.message()).map_err(PipelineError::Filter)? {
                return Ok(None);
            }
        }

        let document = DocumentEvent::new(event.message(), &self.bucket, event.vbucket_uuid());
        let record = self
            .handler
            .handle(SourceHandlerParams {
                event: document,
                topic: &self.topic,
            })
            .map_err(PipelineError::Handler)?;

        Ok(record.map(|record| Converted {
            partition: document.partition(),
            position: PartitionPosition::of(&document),
            record,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        event::{Message, MessageKind},
        handler::{IgnoreDeletesFilter, RawJsonSourceHandler},
        test_utils::{DropAllHandler, FailingFilter, FailingHandler, ReleaseCounter, event},
    };

    fn pipeline(filter: Option<Box<dyn Filter>>, handler: Box<dyn SourceHandler>) -> Pipeline {
        Pipeline::new(filter, handler, "travel", "travel-topic")
    }

    #[test]
    fn test_converts_with_position() {
        let counter = ReleaseCounter::default();
        let mutation = event(&counter, MessageKind::Mutation, 4, 17);
        let converted = pipeline(None, Box::new(RawJsonSourceHandler))
            .process(&mutation)
            .unwrap()
            .unwrap();

        assert_eq!(converted.partition, 4);
        assert_eq!(converted.position, PartitionPosition::new(17, Some(1004)));
        assert!(converted.record.value.is_some());
        // processing alone never releases
        assert_eq!(counter.released(), 0);
    }

    #[test]
    fn test_filtered_out() {
        let counter = ReleaseCounter::default();
        let pipeline = pipeline(
            Some(Box::new(IgnoreDeletesFilter)),
            Box::new(RawJsonSourceHandler),
        );
        let deletion = event(&counter, MessageKind::Deletion, 4, 17);
        assert_eq!(pipeline.process(&deletion).unwrap(), None);
    }

    #[test]
    fn test_dropped_by_handler() {
        let counter = ReleaseCounter::default();
        let pipeline = pipeline(None, Box::new(DropAllHandler));
        let mutation = event(&counter, MessageKind::Mutation, 4, 17);
        assert_eq!(pipeline.process(&mutation).unwrap(), None);
    }

    #[test]
    fn test_collaborator_errors_propagate() {
        let counter = ReleaseCounter::default();
        let mutation = event(&counter, MessageKind::Mutation, 4, 17);

        let err = pipeline(Some(Box::new(FailingFilter)), Box::new(RawJsonSourceHandler))
            .process(&mutation)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Filter(_)));

        let err = pipeline(None, Box::new(FailingHandler))
            .process(&mutation)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Handler(_)));
    }

    #[test]
    fn test_filter_sees_undecorated_message() {
        #[derive(Debug)]
        struct KeyFilter;

        impl Filter for KeyFilter {
            fn pass(&self, message: &Message) -> Result<bool, BoxError> {
                Ok(message.key().starts_with(b"keep"))
            }
        }

        let counter = ReleaseCounter::default();
        let pipeline = pipeline(Some(Box::new(KeyFilter)), Box::new(RawJsonSourceHandler));
        // test_utils::event keys documents "doc-<seqno>"
        assert_eq!(
            pipeline
                .process(&event(&counter, MessageKind::Mutation, 0, 1))
                .unwrap(),
            None
        );
    }
}
