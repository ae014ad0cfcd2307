//! Recorded-output queues for replay substitution
//!
//! Spans are matched to substitution targets by `operation_type`, in start
//! order. Each target gets a FIFO queue of the outputs its spans recorded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use crate::error::{ClearstoneError, Result};
use crate::observability::Span;
use crate::serialization::Snapshot;

/// Maps span operation types to the effect targets they substitute for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockConfig {
    mappings: BTreeMap<String, String>,
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve recorded outputs of `operation_type` spans to calls on `target`
    pub fn map(mut self, operation_type: impl Into<String>, target: impl Into<String>) -> Self {
        self.mappings.insert(operation_type.into(), target.into());
        self
    }

    pub fn target_for(&self, operation_type: &str) -> Option<&str> {
        self.mappings.get(operation_type).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.mappings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// Where recorded outputs are read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MockSource {
    /// Only the spans embedded in the checkpoint
    Embedded,
    /// The full trace, loaded from the trace store
    Store,
}

#[derive(Debug, Clone)]
enum RecordedOutput {
    Ready(Value),
    Unreadable(String),
}

/// FIFO of recorded outputs for one target
#[derive(Debug, Clone)]
pub struct MockQueue {
    target: String,
    operation_types: Vec<String>,
    outputs: VecDeque<RecordedOutput>,
    served: usize,
}

impl MockQueue {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            operation_types: Vec::new(),
            outputs: VecDeque::new(),
            served: 0,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Outputs left to serve
    pub fn remaining(&self) -> usize {
        self.outputs.len()
    }

    /// Outputs already served
    pub fn served(&self) -> usize {
        self.served
    }

    /// Serve the next recorded output.
    ///
    /// # Errors
    ///
    /// `MockExhausted` when the queue is empty, `UnreadableMockOutput` when the
    /// recorded output cannot be decoded.
    pub(crate) fn next_output(&mut self) -> Result<Value> {
        let index = self.served;
        let output = self
            .outputs
            .pop_front()
            .ok_or_else(|| ClearstoneError::MockExhausted {
                target: self.target.clone(),
                satisfied: self.served,
            })?;
        self.served += 1;
        match output {
            RecordedOutput::Ready(value) => Ok(value),
            RecordedOutput::Unreadable(reason) => Err(ClearstoneError::UnreadableMockOutput {
                target: self.target.clone(),
                index,
                reason,
            }),
        }
    }
}

/// One line of the pre-flight report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightEntry {
    pub target: String,
    pub operation_types: Vec<String>,
    pub depth: usize,
}

/// Queue depths announced before a replay starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub source: MockSource,
    pub entries: Vec<PreflightEntry>,
}

impl PreflightReport {
    pub fn depth(&self, target: &str) -> Option<usize> {
        self.entries
            .iter()
            .find(|e| e.target == target)
            .map(|e| e.depth)
    }

    /// Targets that have no recorded outputs
    pub fn empty_targets(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.depth == 0)
            .map(|e| e.target.as_str())
            .collect()
    }
}

/// All substitution queues for a replay session
#[derive(Debug, Clone, Default)]
pub struct MockSet {
    queues: BTreeMap<String, MockQueue>,
}

impl MockSet {
    /// Build queues from recorded spans.
    ///
    /// Spans without an `operation_type`, with an unmapped one, or without a
    /// recorded output are skipped.
    pub fn build(config: &MockConfig, spans: &[&Span]) -> Self {
        let mut queues: BTreeMap<String, MockQueue> = BTreeMap::new();
        for (operation_type, target) in config.iter() {
            queues
                .entry(target.to_string())
                .or_insert_with(|| MockQueue::new(target))
                .operation_types
                .push(operation_type.to_string());
        }

        let mut ordered: Vec<&Span> = spans.to_vec();
        ordered.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        for span in ordered {
            let Some(target) = span
                .operation_type
                .as_deref()
                .and_then(|op| config.target_for(op))
            else {
                continue;
            };
            let Some(snapshot) = &span.output_snapshot else {
                continue;
            };
            let output = match snapshot {
                Snapshot::Captured { value, .. } => match value.to_json() {
                    Ok(value) => RecordedOutput::Ready(value),
                    Err(e) => RecordedOutput::Unreadable(e.to_string()),
                },
                Snapshot::Omitted { reason, type_name } => RecordedOutput::Unreadable(format!(
                    "output of type {type_name} was not recorded: {reason}"
                )),
            };
            if let Some(queue) = queues.get_mut(target) {
                queue.outputs.push_back(output);
            }
        }

        Self { queues }
    }

    pub fn queue(&self, target: &str) -> Option<&MockQueue> {
        self.queues.get(target)
    }

    pub(crate) fn queue_mut(&mut self, target: &str) -> Option<&mut MockQueue> {
        self.queues.get_mut(target)
    }

    pub fn preflight(&self, source: MockSource) -> PreflightReport {
        PreflightReport {
            source,
            entries: self
                .queues
                .values()
                .map(|queue| PreflightEntry {
                    target: queue.target.clone(),
                    operation_types: queue.operation_types.clone(),
                    depth: queue.remaining(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::span::test_support::span;
    use crate::serialization::SnapshotCapture;
    use serde_json::json;

    fn recorded(id: &str, start: u64, op: &str, output: Option<Value>) -> Span {
        let mut s = span("t", id, Some("root"), start);
        s.operation_type = Some(op.to_string());
        s.output_snapshot = output.map(|v| SnapshotCapture::default().capture(&v));
        s
    }

    #[test]
    fn test_queues_follow_start_order() {
        let spans = vec![
            recorded("late", 30, "llm", Some(json!("C"))),
            recorded("early", 10, "llm", Some(json!("A"))),
            recorded("mid", 20, "llm", Some(json!("B"))),
            recorded("tool", 15, "tool", Some(json!({"hits": 2}))),
        ];
        let refs: Vec<&Span> = spans.iter().collect();
        let mut mocks = MockSet::build(&MockConfig::new().map("llm", "llm"), &refs);

        let queue = mocks.queue_mut("llm").unwrap();
        assert_eq!(queue.next_output().unwrap(), json!("A"));
        assert_eq!(queue.next_output().unwrap(), json!("B"));
        assert_eq!(queue.next_output().unwrap(), json!("C"));

        let err = queue.next_output().unwrap_err();
        assert!(matches!(
            err,
            ClearstoneError::MockExhausted { ref target, satisfied: 3 } if target == "llm"
        ));
        assert!(mocks.queue("tool").is_none());
    }

    #[test]
    fn test_spans_without_output_are_skipped() {
        let spans = vec![
            recorded("a", 1, "llm", None),
            recorded("b", 2, "llm", Some(json!("kept"))),
        ];
        let refs: Vec<&Span> = spans.iter().collect();
        let mocks = MockSet::build(&MockConfig::new().map("llm", "chat"), &refs);
        assert_eq!(mocks.queue("chat").unwrap().remaining(), 1);
    }

    #[test]
    fn test_preflight_reports_depths() {
        let spans = vec![recorded("a", 1, "llm", Some(json!("x")))];
        let refs: Vec<&Span> = spans.iter().collect();
        let config = MockConfig::new().map("llm", "llm").map("tool", "search");
        let report = MockSet::build(&config, &refs).preflight(MockSource::Embedded);

        assert_eq!(report.depth("llm"), Some(1));
        assert_eq!(report.depth("search"), Some(0));
        assert_eq!(report.empty_targets(), vec!["search"]);
    }

    #[test]
    fn test_omitted_output_fails_on_its_turn() {
        let mut big = recorded("big", 1, "llm", None);
        big.output_snapshot = Some(SnapshotCapture::new(4).capture(&"too large"));
        let spans = vec![big, recorded("ok", 2, "llm", Some(json!("fine")))];
        let refs: Vec<&Span> = spans.iter().collect();
        let mut mocks = MockSet::build(&MockConfig::new().map("llm", "llm"), &refs);

        let queue = mocks.queue_mut("llm").unwrap();
        assert!(matches!(
            queue.next_output(),
            Err(ClearstoneError::UnreadableMockOutput { index: 0, .. })
        ));
        assert_eq!(queue.next_output().unwrap(), json!("fine"));
    }
}
