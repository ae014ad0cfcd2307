//! Span and trace data model

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::attributes::Attributes;
use crate::error::{ClearstoneError, Result};
use crate::serialization::Snapshot;

/// Nanoseconds since the Unix epoch from a monotonic source.
///
/// The wall clock is read once per process; later readings add elapsed
/// monotonic time so that timestamps never go backwards.
pub fn now_ns() -> u64 {
    static ANCHOR: OnceLock<(u64, Instant)> = OnceLock::new();
    let (wall_ns, instant) = ANCHOR.get_or_init(|| {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        (wall, Instant::now())
    });
    wall_ns.saturating_add(instant.elapsed().as_nanos() as u64)
}

/// Generate a new trace identifier
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a new span identifier
pub fn new_span_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Role of a span within its trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    #[default]
    Internal,
    Client,
    Server,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Internal => "internal",
            SpanKind::Client => "client",
            SpanKind::Server => "server",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

impl FromStr for SpanKind {
    type Err = ClearstoneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(SpanKind::Internal),
            "client" => Ok(SpanKind::Client),
            "server" => Ok(SpanKind::Server),
            "producer" => Ok(SpanKind::Producer),
            "consumer" => Ok(SpanKind::Consumer),
            other => Err(ClearstoneError::Other(format!("unknown span kind '{other}'"))),
        }
    }
}

/// Completion status of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Unset => "unset",
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
        }
    }
}

impl FromStr for SpanStatus {
    type Err = ClearstoneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unset" => Ok(SpanStatus::Unset),
            "ok" => Ok(SpanStatus::Ok),
            "error" => Ok(SpanStatus::Error),
            other => Err(ClearstoneError::Other(format!("unknown span status '{other}'"))),
        }
    }
}

/// Timestamped annotation recorded inside a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp_ns: u64,
    #[serde(default)]
    pub attributes: Attributes,
}

/// Name and version of the code that produced a span
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: String,
}

/// Identity of a span used for parenting
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

/// A timed unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_ns: u64,
    /// Absent while the span is open
    pub end_ns: Option<u64>,
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    pub error_message: Option<String>,
    pub error_stacktrace: Option<String>,
    /// Category used to match this span to a replay substitution target
    pub operation_type: Option<String>,
    pub input_snapshot: Option<Snapshot>,
    pub output_snapshot: Option<Snapshot>,
    pub instrumentation: InstrumentationScope,
    pub service_name: String,
}

impl Span {
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.trace_id.clone(),
            span_id: self.span_id.clone(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.end_ns.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.status == SpanStatus::Error
    }

    /// Duration in nanoseconds, if the span is closed
    pub fn duration_ns(&self) -> Option<u64> {
        self.end_ns.map(|end| end.saturating_sub(self.start_ns))
    }

    /// Chronological ordering key
    pub(crate) fn order_key(&self) -> (u64, &str) {
        (self.start_ns, self.span_id.as_str())
    }
}

/// All spans sharing a trace id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    /// Absent while the root span is still open
    pub root_span_id: Option<String>,
    /// Spans ordered by start time
    pub spans: Vec<Span>,
    pub start_ns: u64,
    pub end_ns: Option<u64>,
}

impl Trace {
    /// Assemble a trace from its spans.
    ///
    /// # Errors
    ///
    /// Returns `TraceNotFound` for an empty span list, and `Other` when spans
    /// from another trace are mixed in or more than one root is present.
    pub fn from_spans(trace_id: impl Into<String>, mut spans: Vec<Span>) -> Result<Self> {
        let trace_id = trace_id.into();
        if spans.is_empty() {
            return Err(ClearstoneError::TraceNotFound(trace_id));
        }
        if let Some(stray) = spans.iter().find(|s| s.trace_id != trace_id) {
            return Err(ClearstoneError::Other(format!(
                "span '{}' belongs to trace '{}', not '{}'",
                stray.span_id, stray.trace_id, trace_id
            )));
        }

        spans.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let mut roots = spans.iter().filter(|s| s.is_root());
        let root_span_id = roots.next().map(|s| s.span_id.clone());
        if roots.next().is_some() {
            return Err(ClearstoneError::Other(format!(
                "trace '{trace_id}' has more than one root span"
            )));
        }

        let start_ns = spans.iter().map(|s| s.start_ns).min().unwrap_or(0);
        let end_ns = spans.iter().filter_map(|s| s.end_ns).max();

        Ok(Self {
            trace_id,
            root_span_id,
            spans,
            start_ns,
            end_ns,
        })
    }

    pub fn span(&self, span_id: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.span_id == span_id)
    }

    pub fn root(&self) -> Option<&Span> {
        self.root_span_id.as_deref().and_then(|id| self.span(id))
    }

    /// Direct children of a span, in start order
    pub fn children(&self, span_id: &str) -> Vec<&Span> {
        self.spans
            .iter()
            .filter(|s| s.parent_span_id.as_deref() == Some(span_id))
            .collect()
    }

    /// Ancestors of a span ordered from the root down, excluding the span itself
    pub fn ancestors(&self, span_id: &str) -> Vec<&Span> {
        let by_id: HashMap<&str, &Span> =
            self.spans.iter().map(|s| (s.span_id.as_str(), s)).collect();

        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = by_id
            .get(span_id)
            .and_then(|s| s.parent_span_id.as_deref());

        while let Some(id) = cursor {
            if !seen.insert(id) {
                break;
            }
            match by_id.get(id) {
                Some(parent) => {
                    chain.push(*parent);
                    cursor = parent.parent_span_id.as_deref();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// All spans below a span, in start order
    pub fn descendants(&self, span_id: &str) -> Vec<&Span> {
        let mut below: HashSet<&str> = HashSet::new();
        let mut frontier = vec![span_id];
        while let Some(id) = frontier.pop() {
            for child in self.children(id) {
                if below.insert(child.span_id.as_str()) {
                    frontier.push(child.span_id.as_str());
                }
            }
        }
        self.spans
            .iter()
            .filter(|s| below.contains(s.span_id.as_str()))
            .collect()
    }

    pub fn error_count(&self) -> usize {
        self.spans.iter().filter(|s| s.is_error()).count()
    }
}

/// One row of a trace listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: String,
    pub root_name: Option<String>,
    pub service_name: String,
    pub start_ns: u64,
    pub end_ns: Option<u64>,
    pub span_count: usize,
    pub error_count: usize,
}

impl TraceSummary {
    pub fn from_trace(trace: &Trace) -> Self {
        Self {
            trace_id: trace.trace_id.clone(),
            root_name: trace.root().map(|s| s.name.clone()),
            service_name: trace
                .root()
                .or_else(|| trace.spans.first())
                .map(|s| s.service_name.clone())
                .unwrap_or_default(),
            start_ns: trace.start_ns,
            end_ns: trace.end_ns,
            span_count: trace.spans.len(),
            error_count: trace.error_count(),
        }
    }
}
