//! Mapping between stream positions and Kafka Connect source partitions / offsets.
//!
//! Kafka Connect identifies a source partition and its offset with untyped maps that it persists
//! on our behalf. The encodings are:
//!
//! * source partition: `{"bucket": <string>, "partition": <string>, "connector"?: <string>}`
//! * source offset: `{"bySeqno": <integer>, "vbuuid"?: <integer>}`
//!
//! The partition number is stringified so it survives Kafka (de)serialization unchanged.
//! `vbuuid` is absent in offsets written before vbucket UUIDs were tracked.
use std::collections::BTreeMap;

use observability_deps::tracing::debug;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::DocumentEvent;

/// The untyped map representation Kafka Connect uses for partitions and offsets.
pub type HostMap = Map<String, Value>;

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("malformed source partition {partition:?}: {source}")]
    MalformedPartition {
        partition: HostMap,
        source: serde_json::Error,
    },

    #[error("source partition number {0:?} is not a valid partition")]
    InvalidPartitionNumber(String),

    #[error("malformed source offset {offset:?}: {source}")]
    MalformedOffset {
        offset: HostMap,
        source: serde_json::Error,
    },
}

/// Where to resume streaming a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionPosition {
    pub by_seqno: u64,
    /// `None` only when read from an offset that predates vbucket UUID tracking.
    pub vbucket_uuid: Option<u64>,
}

impl PartitionPosition {
    pub fn new(by_seqno: u64, vbucket_uuid: Option<u64>) -> Self {
        Self {
            by_seqno,
            vbucket_uuid,
        }
    }

    pub fn of(event: &DocumentEvent<'_>) -> Self {
        Self::new(event.by_seqno(), Some(event.vbucket_uuid()))
    }
}

// bucket and connector only scope the lookup, the partition number is all we need back
#[derive(Debug, Deserialize)]
struct SourcePartition {
    partition: String,
}

#[derive(Debug, Deserialize)]
struct SourceOffset {
    #[serde(rename = "bySeqno")]
    by_seqno: u64,
    #[serde(default)]
    vbuuid: Option<u64>,
}

/// Best-effort bulk lookup of previously committed offsets.
///
/// Kafka Connect returns whatever it has; partitions with no committed offset may be missing from
/// the result or mapped to `None`. Neither is an error.
pub trait OffsetStorageReader: std::fmt::Debug + Send + Sync {
    fn offsets(&self, partitions: &[HostMap]) -> Vec<(HostMap, Option<HostMap>)>;
}

/// Encodes and decodes the source partitions of one task.
#[derive(Debug, Clone)]
pub struct OffsetCodec {
    bucket: String,
    /// Set when offsets are scoped to a connector name.
    connector: Option<String>,
}

impl OffsetCodec {
    pub fn new(bucket: impl Into<String>, connector: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            connector,
        }
    }

    pub fn source_partition(&self, partition: u16) -> HostMap {
        let mut map = HostMap::new();
        map.insert("bucket".to_string(), Value::from(self.bucket.as_str()));
        map.insert("partition".to_string(), Value::from(partition.to_string()));
        if let Some(connector) = &self.connector {
            map.insert("connector".to_string(), Value::from(connector.as_str()));
        }
        map
    }

    pub fn source_partitions(&self, partitions: &[u16]) -> Vec<HostMap> {
        partitions
            .iter()
            .map(|p| self.source_partition(*p))
            .collect()
    }

    pub fn source_offset(position: &PartitionPosition) -> HostMap {
        let mut map = HostMap::new();
        map.insert("bySeqno".to_string(), Value::from(position.by_seqno));
        if let Some(vbuuid) = position.vbucket_uuid {
            map.insert("vbuuid".to_string(), Value::from(vbuuid));
        }
        map
    }

    pub fn decode_partition(partition: &HostMap) -> Result<u16, OffsetError> {
        let decoded: SourcePartition = serde_json::from_value(Value::Object(partition.clone()))
            .map_err(|source| OffsetError::MalformedPartition {
                partition: partition.clone(),
                source,
            })?;
        decoded
            .partition
            .parse()
            .map_err(|_| OffsetError::InvalidPartitionNumber(decoded.partition))
    }

    pub fn decode_offset(offset: &HostMap) -> Result<PartitionPosition, OffsetError> {
        let decoded: SourceOffset = serde_json::from_value(Value::Object(offset.clone()))
            .map_err(|source| OffsetError::MalformedOffset {
                offset: offset.clone(),
                source,
            })?;
        Ok(PartitionPosition::new(decoded.by_seqno, decoded.vbuuid))
    }

    /// Resolve the saved positions of as many of `partitions` as the storage knows about.
    pub fn read_positions(
        &self,
        storage: &dyn OffsetStorageReader,
        partitions: &[u16],
    ) -> Result<BTreeMap<u16, PartitionPosition>, OffsetError> {
        let offsets = storage.offsets(&self.source_partitions(partitions));
        debug!(?offsets, "raw source offsets");

        let positions = Self::decode_offsets(offsets)?;
        debug!(?positions, "partition to saved seqno");
        Ok(positions)
    }

    /// Decode a bulk lookup result. Entries without an offset are skipped.
    pub fn decode_offsets(
        lookup: impl IntoIterator<Item = (HostMap, Option<HostMap>)>,
    ) -> Result<BTreeMap<u16, PartitionPosition>, OffsetError> {
        let mut positions = BTreeMap::new();
        for (partition, offset) in lookup {
            let Some(offset) = offset else {
                continue;
            };
            positions.insert(
                Self::decode_partition(&partition)?,
                Self::decode_offset(&offset)?,
            );
        }
        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::test_utils::MemoryOffsetStore;

    fn map(value: Value) -> HostMap {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_source_partition() {
        let codec = OffsetCodec::new("travel", None);
        assert_eq!(
            Value::Object(codec.source_partition(42)),
            json!({"bucket": "travel", "partition": "42"})
        );

        let codec = OffsetCodec::new("travel", Some("travel-source".to_string()));
        assert_eq!(
            Value::Object(codec.source_partition(42)),
            json!({"bucket": "travel", "partition": "42", "connector": "travel-source"})
        );
    }

    #[test]
    fn test_source_offset() {
        assert_eq!(
            Value::Object(OffsetCodec::source_offset(&PartitionPosition::new(7, Some(99)))),
            json!({"bySeqno": 7, "vbuuid": 99})
        );
        assert_eq!(
            Value::Object(OffsetCodec::source_offset(&PartitionPosition::new(7, None))),
            json!({"bySeqno": 7})
        );
    }

    #[test]
    fn test_decode_skips_missing_offsets() {
        let codec = OffsetCodec::new("travel", None);
        let lookup = vec![
            (codec.source_partition(1), Some(map(json!({"bySeqno": 10, "vbuuid": 5})))),
            (codec.source_partition(2), None),
            (codec.source_partition(3), Some(map(json!({"bySeqno": 30})))),
        ];

        let positions = OffsetCodec::decode_offsets(lookup).unwrap();
        assert_eq!(
            positions,
            BTreeMap::from([
                (1, PartitionPosition::new(10, Some(5))),
                (3, PartitionPosition::new(30, None)),
            ])
        );
    }

    #[test]
    fn test_read_positions_best_effort() {
        let codec = OffsetCodec::new("travel", Some("travel-source".to_string()));
        let store = MemoryOffsetStore::default();
        store.commit(&codec, 5, PartitionPosition::new(100, Some(1)));

        let positions = codec.read_positions(&store, &[4, 5, 6]).unwrap();
        assert_eq!(
            positions,
            BTreeMap::from([(5, PartitionPosition::new(100, Some(1)))])
        );

        // offsets are scoped by connector name
        let other = OffsetCodec::new("travel", Some("other".to_string()));
        assert!(other.read_positions(&store, &[5]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_errors() {
        let offset = map(json!({"bySeqno": 1}));

        let err = OffsetCodec::decode_offsets([(
            map(json!({"bucket": "travel", "partition": "vb1"})),
            Some(offset.clone()),
        )])
        .unwrap_err();
        assert!(matches!(err, OffsetError::InvalidPartitionNumber(p) if p == "vb1"));

        let err = OffsetCodec::decode_offsets([(
            map(json!({"bucket": "travel", "partition": 1})),
            Some(offset),
        )])
        .unwrap_err();
        assert!(matches!(err, OffsetError::MalformedPartition { .. }));

        let err = OffsetCodec::decode_offsets([(
            map(json!({"bucket": "travel", "partition": "1"})),
            Some(map(json!({"bySeqno": "ten"}))),
        )])
        .unwrap_err();
        assert!(matches!(err, OffsetError::MalformedOffset { .. }));
    }

    proptest! {
        #[test]
        fn test_round_trip(
            partition in any::<u16>(),
            by_seqno in any::<u64>(),
            vbucket_uuid in any::<Option<u64>>(),
            connector in proptest::option::of("[a-z]{1,8}"),
        ) {
            let codec = OffsetCodec::new("bucket", connector);
            let position = PartitionPosition::new(by_seqno, vbucket_uuid);

            let decoded = OffsetCodec::decode_offsets([(
                codec.source_partition(partition),
                Some(OffsetCodec::source_offset(&position)),
            )])
            .unwrap();

            prop_assert_eq!(decoded, BTreeMap::from([(partition, position)]));
        }
    }
}
