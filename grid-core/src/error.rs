use thiserror::Error;

use crate::member::MemberId;

pub type Result<T, E = GridError> = core::result::Result<T, E>;

/// Protocol-level failures surfaced to callers of the request/membership
/// APIs. Programming errors (double add, copy into a non-empty directory)
/// are asserts, not variants.
#[derive(Error, Debug)]
pub enum GridError {
    #[error("request timed out (deadline exceeded by {overdue_ms} ms)")]
    Timeout { overdue_ms: u64 },
    #[error("polled member {member_id} left the service before responding")]
    RecipientGone { member_id: MemberId },
    #[error("broadcast payload of {size} bytes exceeds the {limit} byte packet bound")]
    OversizeBroadcast { size: usize, limit: usize },
    #[error("protocol mismatch: {reason}")]
    ProtocolMismatch { reason: String },
    #[error("service is stopping; message processing aborted")]
    ServiceStopping,
    #[error("transport failure: {reason}")]
    Transport { reason: String },
}

impl GridError {
    pub fn mismatch(reason: impl Into<String>) -> Self {
        GridError::ProtocolMismatch {
            reason: reason.into(),
        }
    }
}
