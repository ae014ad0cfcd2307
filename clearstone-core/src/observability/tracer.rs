//! Span creation and lifecycle
//!
//! A [`Tracer`] opens spans parented to the context-local active span. Sync code
//! holds a [`SpanGuard`], which closes the span when dropped (marking it as an
//! error if the thread is panicking). Async code uses [`Tracer::in_span_async`],
//! which keeps the span active across every poll of the wrapped future.

use serde::Serialize;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::attributes::{AttributeValue, Attributes};
use super::context::{self, ContextGuard};
use super::span::{
    InstrumentationScope, Span, SpanContext, SpanEvent, SpanKind, SpanStatus, new_span_id,
    new_trace_id, now_ns,
};
use crate::error::{ClearstoneError, Result};
use crate::serialization::{Snapshot, SnapshotCapture};
use crate::storage::SpanSink;

/// Parameters for a new span
#[derive(Debug, Clone)]
pub struct SpanBuilder {
    name: String,
    kind: SpanKind,
    attributes: Attributes,
    operation_type: Option<String>,
    parent: Option<SpanContext>,
}

impl SpanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SpanKind::Internal,
            attributes: Attributes::new(),
            operation_type: None,
            parent: None,
        }
    }

    pub fn kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Add an attribute. Invalid values are logged and skipped.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        let key = key.into();
        let value = value.into();
        match value.validate(&key) {
            Ok(()) => {
                self.attributes.insert(key, value);
            }
            Err(e) => tracing::warn!(error = %e, "dropping span attribute"),
        }
        self
    }

    pub fn attributes(mut self, attributes: Attributes) -> Self {
        for (key, value) in attributes {
            self = self.attribute(key, value);
        }
        self
    }

    /// Tag the span for replay substitution matching
    pub fn operation_type(mut self, operation_type: impl Into<String>) -> Self {
        self.operation_type = Some(operation_type.into());
        self
    }

    /// Parent to an explicit span instead of the active one
    pub fn parent(mut self, parent: SpanContext) -> Self {
        self.parent = Some(parent);
        self
    }
}

#[derive(Debug)]
enum CloseOutcome {
    Completed,
    Failed { message: String, stacktrace: String },
}

struct SpanState {
    span: Span,
    status_explicit: bool,
}

/// Shared handle to an open span.
///
/// Handles are cheap to clone. Every mutation after the span closes returns
/// `SpanClosed`.
#[derive(Clone)]
pub struct SpanHandle {
    state: Arc<Mutex<SpanState>>,
    context: SpanContext,
    snapshots: SnapshotCapture,
}

impl Debug for SpanHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanHandle")
            .field("trace_id", &self.context.trace_id)
            .field("span_id", &self.context.span_id)
            .finish()
    }
}

impl SpanHandle {
    fn lock(&self) -> MutexGuard<'_, SpanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, f: impl FnOnce(&mut SpanState)) -> Result<()> {
        let mut state = self.lock();
        if state.span.is_closed() {
            return Err(ClearstoneError::SpanClosed {
                span_id: self.context.span_id.clone(),
            });
        }
        f(&mut state);
        Ok(())
    }

    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn span_id(&self) -> &str {
        &self.context.span_id
    }

    pub fn trace_id(&self) -> &str {
        &self.context.trace_id
    }

    pub fn is_closed(&self) -> bool {
        self.lock().span.is_closed()
    }

    /// Copy of the span as currently recorded
    pub fn snapshot(&self) -> Span {
        self.lock().span.clone()
    }

    /// # Errors
    ///
    /// `InvalidAttribute` for values outside the permitted kinds, `SpanClosed` after close.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        value.validate(&key)?;
        self.mutate(|state| {
            state.span.attributes.insert(key, value);
        })
    }

    pub fn set_status(&self, status: SpanStatus) -> Result<()> {
        self.mutate(|state| {
            state.span.status = status;
            state.status_explicit = true;
        })
    }

    pub fn set_operation_type(&self, operation_type: impl Into<String>) -> Result<()> {
        let operation_type = operation_type.into();
        self.mutate(|state| state.span.operation_type = Some(operation_type))
    }

    pub fn add_event(&self, name: impl Into<String>, attributes: Attributes) -> Result<()> {
        for (key, value) in &attributes {
            value.validate(key)?;
        }
        let event = SpanEvent {
            name: name.into(),
            timestamp_ns: now_ns(),
            attributes,
        };
        self.mutate(|state| state.span.events.push(event))
    }

    /// Record the input of the traced operation
    pub fn record_input<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let snapshot = self.snapshots.capture(value);
        log_omitted("input", &snapshot);
        self.mutate(|state| state.span.input_snapshot = Some(snapshot))
    }

    /// Record the output of the traced operation
    pub fn record_output<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let snapshot = self.snapshots.capture(value);
        log_omitted("output", &snapshot);
        self.mutate(|state| state.span.output_snapshot = Some(snapshot))
    }

    /// Mark the span as failed with the error's message and debug representation
    pub fn record_error<E: Display + Debug + ?Sized>(&self, error: &E) -> Result<()> {
        let message = error.to_string();
        let stacktrace = format!("{error:?}");
        self.mutate(|state| {
            state.span.status = SpanStatus::Error;
            state.status_explicit = true;
            state.span.error_message = Some(message);
            state.span.error_stacktrace = Some(stacktrace);
        })
    }

    /// Close the span, returning it the first time only
    fn close(&self, outcome: CloseOutcome) -> Option<Span> {
        let mut state = self.lock();
        if state.span.is_closed() {
            return None;
        }
        match outcome {
            CloseOutcome::Completed => {
                if !state.status_explicit {
                    state.span.status = SpanStatus::Ok;
                }
            }
            CloseOutcome::Failed {
                message,
                stacktrace,
            } => {
                state.span.status = SpanStatus::Error;
                state.span.error_message.get_or_insert(message);
                state.span.error_stacktrace.get_or_insert(stacktrace);
            }
        }
        let end = now_ns().max(state.span.start_ns);
        state.span.end_ns = Some(end);
        Some(state.span.clone())
    }
}

fn log_omitted(which: &str, snapshot: &Snapshot) {
    if let Snapshot::Omitted { reason, type_name } = snapshot {
        tracing::debug!(which, type_name = %type_name, reason = %reason, "span snapshot omitted");
    }
}

/// RAII guard for a sync span. The span is active on this thread until the guard drops.
#[must_use = "the span closes as soon as the guard is dropped"]
pub struct SpanGuard {
    handle: SpanHandle,
    tracer: Tracer,
    _context: ContextGuard,
}

impl SpanGuard {
    pub fn handle(&self) -> &SpanHandle {
        &self.handle
    }

    /// Close the span normally
    pub fn end(self) {
        drop(self);
    }

    /// Close the span as failed
    pub fn fail<E: Display + Debug + ?Sized>(self, error: &E) {
        let outcome = CloseOutcome::Failed {
            message: error.to_string(),
            stacktrace: format!("{error:?}"),
        };
        if let Some(span) = self.handle.close(outcome) {
            self.tracer.submit(span);
        }
    }
}

impl Deref for SpanGuard {
    type Target = SpanHandle;

    fn deref(&self) -> &SpanHandle {
        &self.handle
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        let outcome = if std::thread::panicking() {
            CloseOutcome::Failed {
                message: "panicked".to_string(),
                stacktrace: std::backtrace::Backtrace::force_capture().to_string(),
            }
        } else {
            CloseOutcome::Completed
        };
        if let Some(span) = self.handle.close(outcome) {
            self.tracer.submit(span);
        }
    }
}

/// Closes an async span as cancelled if its future is dropped before completion
struct AsyncSpanCloser {
    tracer: Tracer,
    handle: SpanHandle,
}

impl AsyncSpanCloser {
    fn finish(&self, outcome: CloseOutcome) {
        if let Some(span) = self.handle.close(outcome) {
            self.tracer.submit(span);
        }
    }
}

impl Drop for AsyncSpanCloser {
    fn drop(&mut self) {
        self.finish(CloseOutcome::Failed {
            message: "cancelled".to_string(),
            stacktrace: "future dropped before completion".to_string(),
        });
    }
}

struct TracerInner {
    scope: InstrumentationScope,
    service_name: String,
    sink: Arc<dyn SpanSink>,
    snapshots: SnapshotCapture,
}

/// Creates spans for one instrumentation scope
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer")
            .field("scope", &self.inner.scope)
            .field("service_name", &self.inner.service_name)
            .finish()
    }
}

impl Tracer {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        service_name: impl Into<String>,
        sink: Arc<dyn SpanSink>,
        snapshots: SnapshotCapture,
    ) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                scope: InstrumentationScope {
                    name: name.into(),
                    version: version.into(),
                },
                service_name: service_name.into(),
                sink,
                snapshots,
            }),
        }
    }

    pub fn scope(&self) -> &InstrumentationScope {
        &self.inner.scope
    }

    pub fn span_builder(&self, name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::new(name)
    }

    /// Open a span parented to the active span and make it active
    pub fn span(&self, name: impl Into<String>, kind: SpanKind, attributes: Attributes) -> SpanGuard {
        self.start(SpanBuilder::new(name).kind(kind).attributes(attributes))
    }

    /// Open a span from a builder and make it active
    pub fn start(&self, builder: SpanBuilder) -> SpanGuard {
        let handle = self.open(builder);
        let context = context::enter(Some(handle.context().clone()));
        SpanGuard {
            handle,
            tracer: self.clone(),
            _context: context,
        }
    }

    /// Run `f` inside a span. An `Err` marks the span as failed before it closes.
    pub fn in_span<T, E, F>(&self, builder: SpanBuilder, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&SpanHandle) -> std::result::Result<T, E>,
        E: Display + Debug,
    {
        let guard = self.start(builder);
        let result = f(guard.handle());
        match &result {
            Ok(_) => guard.end(),
            Err(e) => guard.fail(e),
        }
        result
    }

    /// Run the future produced by `f` inside a span.
    ///
    /// The span is active on every poll. An `Err` marks it as failed, and
    /// dropping the future early closes it as cancelled.
    pub async fn in_span_async<T, E, F, Fut>(
        &self,
        builder: SpanBuilder,
        f: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(SpanHandle) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display + Debug,
    {
        let handle = self.open(builder);
        let closer = AsyncSpanCloser {
            tracer: self.clone(),
            handle: handle.clone(),
        };
        let span_context = Some(handle.context().clone());

        let future = {
            let _active = context::enter(span_context.clone());
            f(handle)
        };
        let result = context::with_span_context(span_context, future).await;

        match &result {
            Ok(_) => closer.finish(CloseOutcome::Completed),
            Err(e) => closer.finish(CloseOutcome::Failed {
                message: e.to_string(),
                stacktrace: format!("{e:?}"),
            }),
        }
        result
    }

    fn open(&self, builder: SpanBuilder) -> SpanHandle {
        let parent = builder.parent.or_else(context::current);
        let (trace_id, parent_span_id) = match parent {
            Some(parent) => (parent.trace_id, Some(parent.span_id)),
            None => (new_trace_id(), None),
        };
        let span_id = new_span_id();

        let span = Span {
            span_id: span_id.clone(),
            trace_id: trace_id.clone(),
            parent_span_id,
            name: builder.name,
            kind: builder.kind,
            start_ns: now_ns(),
            end_ns: None,
            status: SpanStatus::Unset,
            attributes: builder.attributes,
            events: Vec::new(),
            error_message: None,
            error_stacktrace: None,
            operation_type: builder.operation_type,
            input_snapshot: None,
            output_snapshot: None,
            instrumentation: self.inner.scope.clone(),
            service_name: self.inner.service_name.clone(),
        };

        SpanHandle {
            state: Arc::new(Mutex::new(SpanState {
                span,
                status_explicit: false,
            })),
            context: SpanContext { trace_id, span_id },
            snapshots: self.inner.snapshots,
        }
    }

    fn submit(&self, span: Span) {
        let span_id = span.span_id.clone();
        if let Err(e) = self.inner.sink.submit(span) {
            tracing::warn!(span_id = %span_id, error = %e, "failed to submit closed span");
        }
    }
}
