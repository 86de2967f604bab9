//! Config for the Couchbase source task.

use std::{
    collections::HashMap,
    ffi::OsString,
    num::{NonZeroUsize, ParseIntError},
};

use clap::{CommandFactory, Parser};
use thiserror::Error;

use crate::redaction::RedactionLevel;

/// Program name handed to clap when parsing a property map.
const PROGRAM_NAME: &str = "cbkafka-source";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid source task configuration: {0}")]
    Invalid(#[from] clap::Error),

    #[error("connector must have a non-blank 'name' config property")]
    BlankTaskName,

    #[error("unknown event filter '{0}'")]
    UnknownFilter(String),

    #[error("unknown source handler '{0}'")]
    UnknownSourceHandler(String),
}

/// Configuration of one source task instance.
///
/// Every long flag corresponds to a dotted property name: `--couchbase-batch-size-max` is read
/// from the `couchbase.batch.size.max` property. See [`SourceTaskConfig::from_properties`].
#[derive(Debug, Clone, Parser)]
#[clap(name = PROGRAM_NAME, disable_help_flag = true, disable_version_flag = true)]
pub struct SourceTaskConfig {
    /// Logical name of the connector this task belongs to.
    #[clap(long = "name", default_value = "")]
    pub name: String,

    /// Bucket to stream changes from.
    #[clap(long = "couchbase-bucket")]
    pub bucket: String,

    /// Default destination topic, used when the source handler does not pick one.
    #[clap(long = "couchbase-topic", default_value = "couchbase")]
    pub topic: String,

    /// Name of the event filter. When absent every event passes.
    #[clap(long = "couchbase-event-filter")]
    pub event_filter: Option<String>,

    /// Name of the source handler that converts events to records.
    #[clap(long = "couchbase-source-handler", default_value = "raw_json")]
    pub source_handler: String,

    /// Maximum number of events processed for one batch handed to Kafka Connect.
    #[clap(long = "couchbase-batch-size-max", default_value = "2000")]
    pub batch_size_max: NonZeroUsize,

    /// Include the connector name in the source partition of every record.
    ///
    /// Allows several connectors to track offsets for the same bucket partitions independently.
    #[clap(
        long = "couchbase-connector-name-in-offsets",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub connector_name_in_offsets: bool,

    /// How much user data may appear in log output.
    #[clap(
        long = "couchbase-log-redaction",
        default_value_t = RedactionLevel::default(),
        value_enum
    )]
    pub log_redaction: RedactionLevel,

    /// Partitions (vbuckets) owned by this task, comma separated.
    #[clap(
        long = "couchbase-partitions",
        value_delimiter = ',',
        value_parser = parse_partition,
        required = true
    )]
    pub partitions: Vec<u16>,
}

impl SourceTaskConfig {
    /// Parse and validate a Kafka Connect property map.
    ///
    /// Properties that do not belong to this config are ignored; the same map usually carries
    /// settings for the framework and for the stream reader as well.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let config = Self::try_parse_from(properties_to_args(properties))?;
        if config.name.trim().is_empty() {
            return Err(ConfigError::BlankTaskName);
        }
        Ok(config)
    }
}

/// List elements may be padded with whitespace, as in Kafka's `LIST` config type.
fn parse_partition(s: &str) -> Result<u16, ParseIntError> {
    s.trim().parse()
}

/// Property name for a long flag, e.g. `couchbase-batch-size-max` -> `couchbase.batch.size.max`.
pub fn property_name(long: &str) -> String {
    long.replace('-', ".")
}

fn properties_to_args(properties: &HashMap<String, String>) -> Vec<OsString> {
    let command = SourceTaskConfig::command();
    let mut args = vec![OsString::from(PROGRAM_NAME)];
    for long in command.get_arguments().filter_map(|arg| arg.get_long()) {
        if let Some(value) = properties.get(&property_name(long)) {
            args.push(format!("--{long}={value}").into());
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn minimal() -> HashMap<String, String> {
        props(&[
            ("name", "orders-source"),
            ("couchbase.bucket", "orders"),
            ("couchbase.partitions", "0,1,2"),
        ])
    }

    #[test]
    fn test_defaults() {
        let config = SourceTaskConfig::from_properties(&minimal()).unwrap();
        assert_eq!(config.name, "orders-source");
        assert_eq!(config.bucket, "orders");
        assert_eq!(config.topic, "couchbase");
        assert_eq!(config.event_filter, None);
        assert_eq!(config.source_handler, "raw_json");
        assert_eq!(config.batch_size_max.get(), 2000);
        assert!(!config.connector_name_in_offsets);
        assert_eq!(config.log_redaction, RedactionLevel::None);
        assert_eq!(config.partitions, vec![0, 1, 2]);
    }

    #[test]
    fn test_all_properties() {
        let mut properties = minimal();
        properties.extend(props(&[
            ("couchbase.topic", "orders-topic"),
            ("couchbase.event.filter", "ignore_deletes"),
            ("couchbase.source.handler", "raw_json_with_metadata"),
            ("couchbase.batch.size.max", "3"),
            ("couchbase.connector.name.in.offsets", "true"),
            ("couchbase.log.redaction", "partial"),
            ("couchbase.partitions", " 7, 1023 ,12"),
        ]));

        let config = SourceTaskConfig::from_properties(&properties).unwrap();
        assert_eq!(config.topic, "orders-topic");
        assert_eq!(config.event_filter.as_deref(), Some("ignore_deletes"));
        assert_eq!(config.source_handler, "raw_json_with_metadata");
        assert_eq!(config.batch_size_max.get(), 3);
        assert!(config.connector_name_in_offsets);
        assert_eq!(config.log_redaction, RedactionLevel::Partial);
        assert_eq!(config.partitions, vec![7, 1023, 12]);
    }

    #[test]
    fn test_unknown_properties_are_ignored() {
        let mut properties = minimal();
        properties.extend(props(&[
            ("connector.class", "com.example.Connector"),
            ("tasks.max", "4"),
            ("couchbase.seed.nodes", "127.0.0.1"),
        ]));
        SourceTaskConfig::from_properties(&properties).unwrap();
    }

    #[test]
    fn test_missing_name() {
        let mut properties = minimal();
        properties.remove("name");
        assert!(matches!(
            SourceTaskConfig::from_properties(&properties),
            Err(ConfigError::BlankTaskName)
        ));
    }

    #[test]
    fn test_blank_name() {
        let mut properties = minimal();
        properties.insert("name".to_string(), "   ".to_string());
        assert!(matches!(
            SourceTaskConfig::from_properties(&properties),
            Err(ConfigError::BlankTaskName)
        ));
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("couchbase.batch.size.max", "0"),
            ("couchbase.batch.size.max", "lots"),
            ("couchbase.partitions", "1,x"),
            ("couchbase.partitions", "70000"),
            ("couchbase.partitions", "1,,2"),
            ("couchbase.log.redaction", "some"),
            ("couchbase.connector.name.in.offsets", "maybe"),
        ] {
            let mut properties = minimal();
            properties.insert(key.to_string(), value.to_string());
            assert!(
                matches!(
                    SourceTaskConfig::from_properties(&properties),
                    Err(ConfigError::Invalid(_))
                ),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_missing_required() {
        let mut properties = minimal();
        properties.remove("couchbase.bucket");
        assert!(matches!(
            SourceTaskConfig::from_properties(&properties),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_property_name() {
        assert_eq!(property_name("couchbase-batch-size-max"), "couchbase.batch.size.max");
        assert_eq!(property_name("name"), "name");
    }
}
