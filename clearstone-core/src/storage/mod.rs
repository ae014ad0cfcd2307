//! Span persistence
//!
//! Closed spans flow from a [`SpanSink`] (normally the [`SpanBuffer`]) into a
//! [`SpanWriter`]. Stored traces are read back through [`TraceReader`].
//!
//! ## Backends
//!
//! - [`TraceStore`]: SQLite database in WAL mode; one writer, concurrent readers
//! - [`InMemoryTraceStore`]: process-local store for tests and short-lived tools

pub mod buffer;
pub mod memory;
pub mod retry;
pub mod sqlite;

pub use buffer::{BufferConfig, BufferStats, FlushErrorHook, SpanBuffer};
pub use memory::InMemoryTraceStore;
pub use retry::RetryConfig;
pub use sqlite::TraceStore;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::observability::{Span, SpanStatus, Trace, TraceSummary};

/// Receives spans as they close
pub trait SpanSink: Send + Sync {
    fn submit(&self, span: Span) -> Result<()>;
}

/// Durable, append-only span persistence
pub trait SpanWriter: Send + Sync + 'static {
    /// Persist a batch atomically: either every span is stored or none are.
    /// Spans already stored under the same (trace_id, span_id) are left untouched.
    fn persist_batch(&self, spans: &[Span]) -> Result<()>;

    /// Whether `persist_batch` blocks on I/O and should run off the async workers
    fn is_blocking(&self) -> bool {
        true
    }
}

/// Read access to stored traces
pub trait TraceReader: Send + Sync + 'static {
    /// Load every stored span of a trace.
    ///
    /// # Errors
    ///
    /// Returns `TraceNotFound` if no spans are stored for `trace_id`.
    fn get_trace(&self, trace_id: &str) -> Result<Trace>;

    /// Summaries of stored traces, newest first
    fn list_traces(&self, limit: usize, filter: &TraceFilter) -> Result<Vec<TraceSummary>>;

    /// Spans matching a query, in start order
    fn query_spans(&self, query: &SpanQuery) -> Result<Vec<Span>>;
}

/// Filter for [`TraceReader::list_traces`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceFilter {
    pub service_name: Option<String>,
    pub root_name: Option<String>,
    /// `Some(true)` keeps traces containing an error span, `Some(false)` keeps clean ones
    pub has_error: Option<bool>,
    pub started_after_ns: Option<u64>,
}

impl TraceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn root_name(mut self, name: impl Into<String>) -> Self {
        self.root_name = Some(name.into());
        self
    }

    pub fn has_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    pub fn started_after(mut self, start_ns: u64) -> Self {
        self.started_after_ns = Some(start_ns);
        self
    }

    pub(crate) fn matches(&self, summary: &TraceSummary) -> bool {
        self.service_name
            .as_ref()
            .is_none_or(|name| &summary.service_name == name)
            && self
                .root_name
                .as_ref()
                .is_none_or(|name| summary.root_name.as_ref() == Some(name))
            && self
                .has_error
                .is_none_or(|wanted| (summary.error_count > 0) == wanted)
            && self
                .started_after_ns
                .is_none_or(|after| summary.start_ns >= after)
    }
}

/// Span search criteria for [`TraceReader::query_spans`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanQuery {
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub status: Option<SpanStatus>,
    pub operation_type: Option<String>,
    pub limit: Option<usize>,
}

impl SpanQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn status(mut self, status: SpanStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn matches(&self, span: &Span) -> bool {
        self.trace_id.as_ref().is_none_or(|id| &span.trace_id == id)
            && self.name.as_ref().is_none_or(|name| &span.name == name)
            && self.status.is_none_or(|status| span.status == status)
            && self
                .operation_type
                .as_ref()
                .is_none_or(|op| span.operation_type.as_ref() == Some(op))
    }
}
