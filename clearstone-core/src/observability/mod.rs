//! Span tracing for agent executions
//!
//! Every unit of agent work is recorded as a [`Span`]: a named, timed node in a
//! tree of spans sharing a trace id. Spans nest through a context-local active
//! span, close exactly once, and are exported in batches to durable storage.
//!
//! # Example
//!
//! ```rust,no_run
//! use clearstone_core::prelude::*;
//!
//! # async fn run() -> clearstone_core::Result<()> {
//! let provider = TracerProvider::new(TracingConfig::default())?;
//! let tracer = provider.tracer("research-agent", "1.0");
//!
//! let answer: clearstone_core::Result<String> = tracer
//!     .in_span_async(SpanBuilder::new("answer").kind(SpanKind::Server), |span| async move {
//!         span.record_input(&"what is the capital of France?")?;
//!         Ok("Paris".to_string())
//!     })
//!     .await;
//!
//! provider.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod attributes;
pub mod context;
pub mod provider;
pub mod span;
pub mod tracer;

pub use attributes::{AttributeValue, Attributes, Scalar};
pub use context::{WithSpanContext, current as current_span, with_span_context};
pub use provider::TracerProvider;
pub use span::{
    InstrumentationScope, Span, SpanContext, SpanEvent, SpanKind, SpanStatus, Trace, TraceSummary,
    now_ns,
};
pub use tracer::{SpanBuilder, SpanGuard, SpanHandle, Tracer};
