//! Pluggable event filters and source handlers.
//!
//! A [`Filter`] decides from the undecorated [`Message`] whether an event is of interest. A
//! [`SourceHandler`] converts a [`DocumentEvent`] into an [`OutputRecord`], or drops it. Both are
//! selected by name from a [`HandlerRegistry`] when the task starts.
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use bytes::Bytes;
use cbkafka_clap_blocks::source::ConfigError;
use serde_json::{Value, json};

use crate::{
    BoxError,
    event::{DocumentEvent, Message, MessageKind},
};

pub trait Filter: Debug + Send {
    /// Whether the event should be converted. Must not retain the message.
    fn pass(&self, message: &Message) -> Result<bool, BoxError>;
}

pub trait SourceHandler: Debug + Send {
    /// Convert an event to a record, or `None` to drop it. Must not retain the event.
    fn handle(&self, params: SourceHandlerParams<'_>) -> Result<Option<OutputRecord>, BoxError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SourceHandlerParams<'a> {
    pub event: DocumentEvent<'a>,
    /// The task's default topic.
    pub topic: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSchema {
    Bytes,
    String,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaAndValue {
    pub schema: ValueSchema,
    pub value: Bytes,
}

impl SchemaAndValue {
    pub fn new(schema: ValueSchema, value: impl Into<Bytes>) -> Self {
        Self {
            schema,
            value: value.into(),
        }
    }
}

/// What a [`SourceHandler`] wants published for an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputRecord {
    /// Destination topic; the task's default topic when `None`.
    pub topic: Option<String>,
    /// Destination Kafka partition; chosen by the producer when `None`.
    pub kafka_partition: Option<i32>,
    pub key: Option<SchemaAndValue>,
    /// `None` produces a tombstone.
    pub value: Option<SchemaAndValue>,
    /// Milliseconds since the epoch.
    pub timestamp: Option<i64>,
}

/// Passes every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPassFilter;

impl Filter for AllPassFilter {
    fn pass(&self, _message: &Message) -> Result<bool, BoxError> {
        Ok(true)
    }
}

/// Passes mutations only, dropping deletions and expirations.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreDeletesFilter;

impl Filter for IgnoreDeletesFilter {
    fn pass(&self, message: &Message) -> Result<bool, BoxError> {
        Ok(message.kind() == MessageKind::Mutation)
    }
}

/// Publishes the document content as is, keyed by document id.
///
/// Removals are published as tombstones.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawJsonSourceHandler;

impl SourceHandler for RawJsonSourceHandler {
    fn handle(&self, params: SourceHandlerParams<'_>) -> Result<Option<OutputRecord>, BoxError> {
        let event = params.event;
        let value = (!event.kind().is_removal())
            .then(|| SchemaAndValue::new(ValueSchema::Bytes, event.content().clone()));

        Ok(Some(OutputRecord {
            key: Some(SchemaAndValue::new(ValueSchema::String, event.key().clone())),
            value,
            ..Default::default()
        }))
    }
}

/// Publishes a JSON envelope carrying the document content together with its metadata.
///
/// Content that isn't valid JSON is embedded as a (lossily decoded) string.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawJsonWithMetadataSourceHandler;

impl SourceHandler for RawJsonWithMetadataSourceHandler {
    fn handle(&self, params: SourceHandlerParams<'_>) -> Result<Option<OutputRecord>, BoxError> {
        let event = params.event;
        let content = if event.kind().is_removal() {
            Value::Null
        } else {
            serde_json::from_slice(event.content()).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(event.content()).into_owned())
            })
        };
        let envelope = json!({
            "event": event.kind().as_str(),
            "bucket": event.bucket(),
            "partition": event.partition(),
            "vBucketUuid": event.vbucket_uuid(),
            "bySeqno": event.by_seqno(),
            "revSeqno": event.rev_seqno(),
            "cas": event.cas(),
            "key": String::from_utf8_lossy(event.key()),
            "content": content,
        });

        Ok(Some(OutputRecord {
            key: Some(SchemaAndValue::new(ValueSchema::String, event.key().clone())),
            value: Some(SchemaAndValue::new(
                ValueSchema::Json,
                serde_json::to_vec(&envelope)?,
            )),
            ..Default::default()
        }))
    }
}

type FilterFactory = Arc<dyn Fn() -> Box<dyn Filter> + Send + Sync>;
type SourceHandlerFactory = Arc<dyn Fn() -> Box<dyn SourceHandler> + Send + Sync>;

/// Named constructors for filters and source handlers.
#[derive(Clone)]
pub struct HandlerRegistry {
    filters: BTreeMap<String, FilterFactory>,
    handlers: BTreeMap<String, SourceHandlerFactory>,
}

impl HandlerRegistry {
    /// A registry without any entries.
    pub fn empty() -> Self {
        Self {
            filters: BTreeMap::new(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Filter> + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn register_source_handler<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn SourceHandler> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn filter(&self, name: &str) -> Result<Box<dyn Filter>, ConfigError> {
        self.filters
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownFilter(name.to_string()))
    }

    pub fn source_handler(&self, name: &str) -> Result<Box<dyn SourceHandler>, ConfigError> {
        self.handlers
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownSourceHandler(name.to_string()))
    }
}

impl Default for HandlerRegistry {
    /// A registry with the built-in filters and handlers.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_filter("all_pass", || Box::new(AllPassFilter))
            .register_filter("ignore_deletes", || Box::new(IgnoreDeletesFilter))
            .register_source_handler("raw_json", || Box::new(RawJsonSourceHandler))
            .register_source_handler("raw_json_with_metadata", || {
                Box::new(RawJsonWithMetadataSourceHandler)
            });
        registry
    }
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
