//! Checkpoint data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::agent::{AgentState, StateFidelity};
use crate::observability::Span;

/// Version of the checkpoint artifact layout written by this library
pub const CHECKPOINT_FORMAT_VERSION: u16 = 1;

/// Frozen agent state at a chosen span, plus the trace context around it
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub trace_id: String,
    pub target_span_id: String,
    /// Registry key of the agent's class
    pub agent_class: String,
    pub agent_state: AgentState,
    pub state_fidelity: StateFidelity,
    /// Ancestors of the target from the root down; the target span is last
    pub trace_context: Vec<Span>,
    /// Spans below the target, in start order
    pub descendant_spans: Vec<Span>,
    pub format_version: u16,
    pub library_version: String,
}

impl Checkpoint {
    pub fn target_span(&self) -> Option<&Span> {
        self.trace_context.last()
    }

    /// Every embedded span in chronological order
    pub fn embedded_spans(&self) -> Vec<&Span> {
        let mut spans: Vec<&Span> = self
            .trace_context
            .iter()
            .chain(self.descendant_spans.iter())
            .collect();
        spans.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        spans
    }

    /// Seed for replay randomness, derived from the checkpoint id
    pub fn replay_seed(&self) -> u64 {
        let digest = Sha256::digest(self.checkpoint_id.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(seed)
    }
}

/// Metadata readable without decoding the agent state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub trace_id: String,
    pub target_span_id: String,
    pub target_span_name: Option<String>,
    pub agent_class: String,
    pub state_fidelity: StateFidelity,
    pub format_version: u16,
    pub library_version: String,
    pub state_fields: Vec<String>,
    pub context_span_count: usize,
    pub descendant_span_count: usize,
}
