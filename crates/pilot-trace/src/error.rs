//! Error types for the audit trail

/// Errors raised while writing or verifying the trace
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Durable sink rejected the event
    #[error("trace sink write failed: {0}")]
    Sink(String),

    /// I/O failure in a file-backed sink
    #[error("trace sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Event could not be serialized
    #[error("trace serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Hash chain does not verify
    #[error("trace integrity violation at sequence {seq}")]
    IntegrityViolation { seq: u64 },
}

impl TraceError {
    /// Whether the error means the stored log itself is corrupt
    #[inline]
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::IntegrityViolation { .. })
    }
}
