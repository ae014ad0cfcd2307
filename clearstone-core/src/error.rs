//! Error types for Clearstone operations

/// Result type for Clearstone operations
pub type Result<T> = std::result::Result<T, ClearstoneError>;

/// Error types for the Clearstone tracing, checkpoint and replay subsystems
#[derive(Debug, thiserror::Error)]
pub enum ClearstoneError {
    /// A span was mutated after it was closed
    #[error("Span '{span_id}' is closed and can no longer be modified")]
    SpanClosed {
        /// Identifier of the closed span
        span_id: String,
    },

    /// The tracing provider has been shut down and rejects new spans
    #[error("Tracer provider has been shut down")]
    ProviderShutdown,

    /// A batch could not be persisted after exhausting retries
    #[error("Failed to persist batch of {span_count} span(s) after {attempts} attempt(s): {reason}")]
    StorageWrite {
        /// Number of spans in the dropped batch
        span_count: usize,
        /// Number of attempts made
        attempts: usize,
        /// Last error reported by the store
        reason: String,
    },

    /// No spans are stored for the requested trace
    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    /// The checkpoint target span is not part of the trace
    #[error("Span '{span_id}' not found in trace '{trace_id}'")]
    TargetSpanNotFound {
        /// Trace that was searched
        trace_id: String,
        /// Span that was requested
        span_id: String,
    },

    /// A checkpoint artifact is structurally damaged
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// The recorded agent class cannot be resolved for rehydration
    #[error("Unknown agent class: {0}")]
    UnknownAgentClass(String),

    /// Captured agent state exceeds the configured limit
    #[error("Agent state is {size} bytes, exceeding the limit of {limit} bytes")]
    StateTooLarge {
        /// Encoded state size in bytes
        size: usize,
        /// Configured maximum in bytes
        limit: usize,
    },

    /// A substitution target was invoked with an empty queue
    #[error("Mock for target '{target}' exhausted after {satisfied} satisfied call(s)")]
    MockExhausted {
        /// Substitution target that was invoked
        target: String,
        /// Number of calls served before exhaustion
        satisfied: usize,
    },

    /// A substitution target was invoked that no mock mapping declares
    #[error("No substitution registered for target '{0}'")]
    UnmappedTarget(String),

    /// A recorded output could not be decoded when its turn came
    #[error("Recorded output #{index} for target '{target}' is unreadable: {reason}")]
    UnreadableMockOutput {
        /// Substitution target
        target: String,
        /// Position of the output in the queue
        index: usize,
        /// Decoding failure
        reason: String,
    },

    /// An attribute value outside the permitted kinds
    #[error("Invalid attribute '{key}': {reason}")]
    InvalidAttribute {
        /// Attribute key
        key: String,
        /// Why the value was rejected
        reason: String,
    },

    /// The replay state machine was driven out of order
    #[error("Invalid replay transition from {from} to {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The step controller aborted a debugging session
    #[error("Debugging session aborted by step controller")]
    SessionAborted,

    /// A live effect handler failed
    #[error("Effect '{target}' failed: {error}")]
    Effect {
        /// Target that was invoked
        target: String,
        /// Handler error
        error: anyhow::Error,
    },

    /// The replayed agent function returned its own error
    #[error("Agent function failed: {0}")]
    Agent(anyhow::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// SQLite error from the trace store
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// MessagePack encoding error
    #[error("Binary encoding error: {0}")]
    Encoding(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ClearstoneError {
    /// Returns true for errors raised by the replay substitution seam
    pub fn is_replay_seam_error(&self) -> bool {
        matches!(
            self,
            ClearstoneError::MockExhausted { .. }
                | ClearstoneError::UnmappedTarget(_)
                | ClearstoneError::UnreadableMockOutput { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for ClearstoneError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ClearstoneError::Encoding(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ClearstoneError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ClearstoneError::Encoding(err.to_string())
    }
}

impl From<String> for ClearstoneError {
    fn from(s: String) -> Self {
        ClearstoneError::Other(s)
    }
}

impl From<&str> for ClearstoneError {
    fn from(s: &str) -> Self {
        ClearstoneError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ClearstoneError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ClearstoneError>() {
            Ok(inner) => inner,
            Err(other) => ClearstoneError::Agent(other),
        }
    }
}
