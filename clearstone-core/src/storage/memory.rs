//! In-memory trace store

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use super::{SpanQuery, SpanSink, SpanWriter, TraceFilter, TraceReader};
use crate::error::{ClearstoneError, Result};
use crate::observability::{Span, Trace, TraceSummary};

/// Process-local span store with the same append-only semantics as [`super::TraceStore`]
#[derive(Debug, Default)]
pub struct InMemoryTraceStore {
    traces: RwLock<HashMap<String, BTreeMap<String, Span>>>,
}

impl InMemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored spans
    pub fn span_count(&self) -> usize {
        self.traces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(BTreeMap::len)
            .sum()
    }
}

impl SpanWriter for InMemoryTraceStore {
    fn persist_batch(&self, spans: &[Span]) -> Result<()> {
        let mut traces = self.traces.write().unwrap_or_else(PoisonError::into_inner);
        for span in spans {
            traces
                .entry(span.trace_id.clone())
                .or_default()
                .entry(span.span_id.clone())
                .or_insert_with(|| span.clone());
        }
        Ok(())
    }

    fn is_blocking(&self) -> bool {
        false
    }
}

impl SpanSink for InMemoryTraceStore {
    fn submit(&self, span: Span) -> Result<()> {
        self.persist_batch(std::slice::from_ref(&span))
    }
}

impl TraceReader for InMemoryTraceStore {
    fn get_trace(&self, trace_id: &str) -> Result<Trace> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        let spans = traces
            .get(trace_id)
            .map(|spans| spans.values().cloned().collect::<Vec<_>>())
            .ok_or_else(|| ClearstoneError::TraceNotFound(trace_id.to_string()))?;
        Trace::from_spans(trace_id, spans)
    }

    fn list_traces(&self, limit: usize, filter: &TraceFilter) -> Result<Vec<TraceSummary>> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries = Vec::new();
        for (trace_id, spans) in traces.iter() {
            let trace = Trace::from_spans(trace_id.clone(), spans.values().cloned().collect())?;
            let summary = TraceSummary::from_trace(&trace);
            if filter.matches(&summary) {
                summaries.push(summary);
            }
        }
        summaries.sort_by(|a, b| {
            b.start_ns
                .cmp(&a.start_ns)
                .then_with(|| a.trace_id.cmp(&b.trace_id))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    fn query_spans(&self, query: &SpanQuery) -> Result<Vec<Span>> {
        let traces = self.traces.read().unwrap_or_else(PoisonError::into_inner);
        let mut spans: Vec<Span> = traces
            .values()
            .flat_map(BTreeMap::values)
            .filter(|span| query.matches(span))
            .cloned()
            .collect();
        spans.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        if let Some(limit) = query.limit {
            spans.truncate(limit);
        }
        Ok(spans)
    }
}
