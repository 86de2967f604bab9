//! Change events as produced by the stream reader.
//!
//! A [`ChangeEvent`] owns a [`Message`] whose backing buffer has a manual lifetime: whoever
//! finishes processing the event calls [`Message::release`] to observe the outcome. A message
//! dropped while still holding its buffer releases it on drop and logs a failure.

use std::fmt::Debug;

use bytes::Bytes;
use observability_deps::tracing::warn;
use thiserror::Error;

use crate::{BoxError, redaction::redact_user};

#[derive(Debug, Error)]
#[error("failed to release message buffer: {0}")]
pub struct ReleaseError(#[source] pub BoxError);

/// The buffer a [`Message`] was decoded from.
///
/// Implementations return the memory to wherever it came from, e.g. a pooled allocator. The
/// [`Message`] guarantees `release` is invoked at most once.
pub trait MessageBuffer: Debug + Send {
    fn release(&mut self) -> Result<(), BoxError>;
}

/// Buffer that needs no explicit release, used for messages built from owned data.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnpooledBuffer;

impl MessageBuffer for UnpooledBuffer {
    fn release(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Mutation,
    Deletion,
    Expiration,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mutation => "mutation",
            Self::Deletion => "deletion",
            Self::Expiration => "expiration",
        }
    }

    /// Deletions and expirations both remove the document.
    pub fn is_removal(&self) -> bool {
        matches!(self, Self::Deletion | Self::Expiration)
    }
}

/// Undecorated document change: what the server sent, without bookkeeping added by this crate.
#[derive(Debug)]
pub struct Message {
    kind: MessageKind,
    partition: u16,
    by_seqno: u64,
    rev_seqno: u64,
    cas: u64,
    key: Bytes,
    content: Bytes,
    buffer: Option<Box<dyn MessageBuffer>>,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        partition: u16,
        by_seqno: u64,
        key: impl Into<Bytes>,
        content: impl Into<Bytes>,
        buffer: Box<dyn MessageBuffer>,
    ) -> Self {
        Self {
            kind,
            partition,
            by_seqno,
            rev_seqno: 0,
            cas: 0,
            key: key.into(),
            content: content.into(),
            buffer: Some(buffer),
        }
    }

    pub fn with_rev_seqno(mut self, rev_seqno: u64) -> Self {
        self.rev_seqno = rev_seqno;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The partition (vbucket) this change belongs to.
    pub fn partition(&self) -> u16 {
        self.partition
    }

    pub fn by_seqno(&self) -> u64 {
        self.by_seqno
    }

    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Document id.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Document body. Empty for deletions and expirations.
    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Number of bytes the message occupies on the wire, for flow control.
    pub fn size(&self) -> usize {
        self.key.len() + self.content.len()
    }

    /// Whether the backing buffer was already returned.
    pub fn is_released(&self) -> bool {
        self.buffer.is_none()
    }

    /// Return the backing buffer. Only the first call has any effect.
    pub fn release(&mut self) -> Result<(), ReleaseError> {
        match self.buffer.take() {
            Some(mut buffer) => buffer.release().map_err(ReleaseError),
            None => Ok(()),
        }
    }
}

impl Drop for Message {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                error = %e,
                partition = self.partition,
                by_seqno = self.by_seqno,
                key = %redact_user(String::from_utf8_lossy(&self.key)),
                "failed to release buffer of dropped message"
            );
        }
    }
}

/// Tells the reader an event was durably handed off, e.g. to open the flow control window.
pub trait Acknowledge: Debug + Send + Sync {
    fn ack(&self, message: &Message);
}

/// Acknowledger for readers without flow control.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAck;

impl Acknowledge for NoopAck {
    fn ack(&self, _message: &Message) {}
}

/// A raw event in transit from the stream reader to the batch assembler.
#[derive(Debug)]
pub struct ChangeEvent {
    message: Message,
    vbucket_uuid: u64,
    ack: Box<dyn Acknowledge>,
}

impl ChangeEvent {
    pub fn new(message: Message, vbucket_uuid: u64, ack: Box<dyn Acknowledge>) -> Self {
        Self {
            message,
            vbucket_uuid,
            ack,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    /// Partition epoch identifier the event was streamed under.
    pub fn vbucket_uuid(&self) -> u64 {
        self.vbucket_uuid
    }

    pub fn ack(&self) {
        self.ack.ack(&self.message);
    }

    pub fn release(&mut self) -> Result<(), ReleaseError> {
        self.message.release()
    }
}

/// Read-only view of a message decorated with the bookkeeping needed to resume a stream.
#[derive(Debug, Clone, Copy)]
pub struct DocumentEvent<'a> {
    message: &'a Message,
    bucket: &'a str,
    vbucket_uuid: u64,
}

impl<'a> DocumentEvent<'a> {
    pub fn new(message: &'a Message, bucket: &'a str, vbucket_uuid: u64) -> Self {
        Self {
            message,
            bucket,
            vbucket_uuid,
        }
    }

    pub fn bucket(&self) -> &'a str {
        self.bucket
    }

    pub fn partition(&self) -> u16 {
        self.message.partition()
    }

    pub fn by_seqno(&self) -> u64 {
        self.message.by_seqno()
    }

    pub fn vbucket_uuid(&self) -> u64 {
        self.vbucket_uuid
    }

    pub fn rev_seqno(&self) -> u64 {
        self.message.rev_seqno()
    }

    pub fn cas(&self) -> u64 {
        self.message.cas()
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    pub fn key(&self) -> &'a Bytes {
        self.message.key()
    }

    pub fn content(&self) -> &'a Bytes {
        self.message.content()
    }
}
