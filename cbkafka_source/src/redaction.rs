//! Process wide redaction of user data in log output.
use std::{
    fmt::Display,
    sync::atomic::{AtomicU8, Ordering},
};

use cbkafka_clap_blocks::redaction::RedactionLevel;

static REDACTION_LEVEL: AtomicU8 = AtomicU8::new(0);

pub fn set_redaction_level(level: RedactionLevel) {
    REDACTION_LEVEL.store(level.as_u8(), Ordering::Relaxed);
}

pub fn redaction_level() -> RedactionLevel {
    RedactionLevel::from_u8(REDACTION_LEVEL.load(Ordering::Relaxed))
}

/// Wraps user data so it is tagged for redaction when formatted, depending on the current level.
#[derive(Debug)]
pub struct Redacted<T> {
    value: T,
    level: RedactionLevel,
}

pub fn redact_user<T: Display>(value: T) -> Redacted<T> {
    Redacted {
        value,
        level: redaction_level(),
    }
}

impl<T: Display> Display for Redacted<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.level {
            RedactionLevel::None => write!(f, "{}", self.value),
            RedactionLevel::Partial | RedactionLevel::Full => write!(f, "<ud>{}</ud>", self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        let plain = Redacted {
            value: "airline_10",
            level: RedactionLevel::None,
        };
        assert_eq!(plain.to_string(), "airline_10");

        for level in [RedactionLevel::Partial, RedactionLevel::Full] {
            let tagged = Redacted {
                value: "airline_10",
                level,
            };
            assert_eq!(tagged.to_string(), "<ud>airline_10</ud>");
        }
    }
}
