//! Config for log redaction.

/// How much user data may appear in log output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RedactionLevel {
    /// Log everything as is.
    #[default]
    None,

    /// Wrap user data (document keys and contents) in redaction tags.
    Partial,

    /// Wrap user data, metadata and system data in redaction tags.
    Full,
}

impl RedactionLevel {
    /// Compact representation, used to store the level in an atomic.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Partial => 1,
            Self::Full => 2,
        }
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values fall back to [`RedactionLevel::Full`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::None,
            1 => Self::Partial,
            _ => Self::Full,
        }
    }
}

impl std::fmt::Display for RedactionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Partial => write!(f, "partial"),
            Self::Full => write!(f, "full"),
        }
    }
}
