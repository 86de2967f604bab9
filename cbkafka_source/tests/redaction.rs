//! The redaction level is process wide, so this runs in its own test binary.
use std::sync::Arc;

use cbkafka_clap_blocks::redaction::RedactionLevel;
use cbkafka_source::{
    SourceTask, TaskContext,
    redaction::{redact_user, redaction_level},
    test_utils::{MemoryOffsetStore, ScriptedReaderFactory, properties},
};

#[test_log::test]
fn test_start_applies_redaction_level() {
    let mut task = SourceTask::new(TaskContext::new(
        Arc::new(MemoryOffsetStore::default()),
        Arc::new(ScriptedReaderFactory::default()),
    ));
    assert_eq!(redaction_level(), RedactionLevel::None);
    assert_eq!(redact_user("airline_10").to_string(), "airline_10");

    task.start(&properties(&[("couchbase.log.redaction", "partial")]))
        .unwrap();
    assert_eq!(redaction_level(), RedactionLevel::Partial);
    assert_eq!(redact_user("airline_10").to_string(), "<ud>airline_10</ud>");
    task.stop().unwrap();
}
