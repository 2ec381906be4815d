use std::fmt;

use thiserror::Error;

/// Why a wire payload could not be turned into protocol messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum DecodeReason {
    InvalidJson,
    InvalidShape,
}

impl DecodeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodeReason::InvalidJson => "invalid_json",
            DecodeReason::InvalidShape => "invalid_shape",
        }
    }
}

impl fmt::Display for DecodeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode failures are values: callers surface them as diagnostics instead of
/// dropping the payload.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("payload rejected: {reason}")]
pub struct DecodeFailure {
    pub reason: DecodeReason,
    /// Normalized payload text, kept for diagnostics.
    pub raw: String,
}

impl DecodeFailure {
    pub(crate) fn new(reason: DecodeReason, raw: String) -> Self {
        Self { reason, raw }
    }
}
