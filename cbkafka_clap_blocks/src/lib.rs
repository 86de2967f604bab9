//! Building blocks for the configuration of a Couchbase source task.
//!
//! Kafka Connect hands a task its configuration as a flat map of dotted property names to string
//! values. The blocks in this crate describe that surface with `clap` so the same definitions
//! give us parsing, defaults, validation and help text.
pub mod redaction;
pub mod source;
