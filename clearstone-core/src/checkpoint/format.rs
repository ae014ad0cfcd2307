//! Checkpoint artifact encoding
//!
//! ```text
//! magic "CLSTCKPT" | version u16 | header_len u32 | header (JSON)
//!                  | blob_len u64 | blob | sha256(header || blob)
//! ```
//!
//! Integers are little-endian. The header holds all metadata, the embedded spans
//! and the state layout. JSON-representable state fields are stored inline in
//! the layout; MessagePack fields are slices of the blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;

use super::agent::{AgentState, StateFidelity};
use super::model::{CHECKPOINT_FORMAT_VERSION, Checkpoint, CheckpointSummary};
use crate::error::{ClearstoneError, Result};
use crate::observability::Span;
use crate::serialization::{HybridValue, SerializationFormat};

pub const CHECKPOINT_MAGIC: &[u8; 8] = b"CLSTCKPT";

const PREFIX_LEN: usize = 8 + 2 + 4;
const CHECKSUM_LEN: usize = 32;

/// Where a state field lives in the artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum FieldLayout {
    Json { value: Value },
    Msgpack { offset: u64, len: u64 },
}

impl FieldLayout {
    pub fn format(&self) -> SerializationFormat {
        match self {
            FieldLayout::Json { .. } => SerializationFormat::Json,
            FieldLayout::Msgpack { .. } => SerializationFormat::Msgpack,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointHeader {
    checkpoint_id: String,
    created_at: DateTime<Utc>,
    trace_id: String,
    target_span_id: String,
    agent_class: String,
    state_fidelity: StateFidelity,
    format_version: u16,
    library_version: String,
    trace_context: Vec<Span>,
    descendant_spans: Vec<Span>,
    state_layout: BTreeMap<String, FieldLayout>,
}

impl CheckpointHeader {
    fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            created_at: self.created_at,
            trace_id: self.trace_id.clone(),
            target_span_id: self.target_span_id.clone(),
            target_span_name: self.trace_context.last().map(|s| s.name.clone()),
            agent_class: self.agent_class.clone(),
            state_fidelity: self.state_fidelity,
            format_version: self.format_version,
            library_version: self.library_version.clone(),
            state_fields: self.state_layout.keys().cloned().collect(),
            context_span_count: self.trace_context.len(),
            descendant_span_count: self.descendant_spans.len(),
        }
    }
}

fn corrupt(reason: impl Into<String>) -> ClearstoneError {
    ClearstoneError::CorruptCheckpoint(reason.into())
}

/// Encode a checkpoint into its artifact bytes
pub fn encode(checkpoint: &Checkpoint) -> Result<Vec<u8>> {
    let mut blob = Vec::new();
    let mut state_layout = BTreeMap::new();
    for (name, value) in checkpoint.agent_state.iter() {
        let layout = match value {
            HybridValue::Json { value } => FieldLayout::Json {
                value: value.clone(),
            },
            HybridValue::Msgpack { data } => {
                let offset = blob.len() as u64;
                blob.extend_from_slice(data);
                FieldLayout::Msgpack {
                    offset,
                    len: data.len() as u64,
                }
            }
        };
        state_layout.insert(name.to_string(), layout);
    }

    let header = CheckpointHeader {
        checkpoint_id: checkpoint.checkpoint_id.clone(),
        created_at: checkpoint.created_at,
        trace_id: checkpoint.trace_id.clone(),
        target_span_id: checkpoint.target_span_id.clone(),
        agent_class: checkpoint.agent_class.clone(),
        state_fidelity: checkpoint.state_fidelity,
        format_version: checkpoint.format_version,
        library_version: checkpoint.library_version.clone(),
        trace_context: checkpoint.trace_context.clone(),
        descendant_spans: checkpoint.descendant_spans.clone(),
        state_layout,
    };
    let header_bytes = serde_json::to_vec(&header)?;
    let header_len = u32::try_from(header_bytes.len())
        .map_err(|_| ClearstoneError::Encoding("checkpoint header exceeds 4 GiB".to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(&header_bytes);
    hasher.update(&blob);
    let checksum = hasher.finalize();

    let mut out =
        Vec::with_capacity(PREFIX_LEN + header_bytes.len() + 8 + blob.len() + CHECKSUM_LEN);
    out.extend_from_slice(CHECKPOINT_MAGIC);
    out.extend_from_slice(&CHECKPOINT_FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&header_len.to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&(blob.len() as u64).to_le_bytes());
    out.extend_from_slice(&blob);
    out.extend_from_slice(&checksum);
    Ok(out)
}

fn check_prefix(prefix: &[u8; PREFIX_LEN]) -> Result<usize> {
    if &prefix[..8] != CHECKPOINT_MAGIC {
        return Err(corrupt("not a checkpoint file (bad magic)"));
    }
    let version = u16::from_le_bytes([prefix[8], prefix[9]]);
    if version != CHECKPOINT_FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {version} (expected {CHECKPOINT_FORMAT_VERSION})"
        )));
    }
    let header_len = u32::from_le_bytes([prefix[10], prefix[11], prefix[12], prefix[13]]);
    Ok(header_len as usize)
}

/// Decode a complete artifact, verifying its checksum
pub fn decode(bytes: &[u8]) -> Result<Checkpoint> {
    let prefix: &[u8; PREFIX_LEN] = bytes
        .get(..PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| corrupt("truncated before header"))?;
    let header_len = check_prefix(prefix)?;

    let header_end = PREFIX_LEN
        .checked_add(header_len)
        .ok_or_else(|| corrupt("header length overflow"))?;
    let header_bytes = bytes
        .get(PREFIX_LEN..header_end)
        .ok_or_else(|| corrupt("truncated header"))?;

    let blob_len_bytes: [u8; 8] = bytes
        .get(header_end..header_end + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| corrupt("truncated before state blob"))?;
    let blob_len = usize::try_from(u64::from_le_bytes(blob_len_bytes))
        .map_err(|_| corrupt("state blob length overflow"))?;
    let blob_start = header_end + 8;
    let blob_end = blob_start
        .checked_add(blob_len)
        .ok_or_else(|| corrupt("state blob length overflow"))?;
    let blob = bytes
        .get(blob_start..blob_end)
        .ok_or_else(|| corrupt("truncated state blob"))?;

    let checksum = bytes
        .get(blob_end..)
        .filter(|rest| rest.len() == CHECKSUM_LEN)
        .ok_or_else(|| corrupt("missing or malformed checksum"))?;
    let mut hasher = Sha256::new();
    hasher.update(header_bytes);
    hasher.update(blob);
    if hasher.finalize().as_slice() != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let header: CheckpointHeader = serde_json::from_slice(header_bytes)
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;

    let mut agent_state = AgentState::new();
    for (name, layout) in header.state_layout {
        let value = match layout {
            FieldLayout::Json { value } => HybridValue::Json { value },
            FieldLayout::Msgpack { offset, len } => {
                let start = usize::try_from(offset).map_err(|_| corrupt("field offset overflow"))?;
                let end = usize::try_from(len)
                    .ok()
                    .and_then(|len| start.checked_add(len))
                    .ok_or_else(|| corrupt("field length overflow"))?;
                let data = blob.get(start..end).ok_or_else(|| {
                    corrupt(format!("state field '{name}' lies outside the blob"))
                })?;
                HybridValue::from_msgpack(data.to_vec())
            }
        };
        agent_state.insert_encoded(name, value);
    }

    Ok(Checkpoint {
        checkpoint_id: header.checkpoint_id,
        created_at: header.created_at,
        trace_id: header.trace_id,
        target_span_id: header.target_span_id,
        agent_class: header.agent_class,
        agent_state,
        state_fidelity: header.state_fidelity,
        trace_context: header.trace_context,
        descendant_spans: header.descendant_spans,
        format_version: header.format_version,
        library_version: header.library_version,
    })
}

/// Read only the header of an artifact. The state blob and checksum are not read.
pub fn read_summary<R: Read>(mut reader: R) -> Result<CheckpointSummary> {
    let mut prefix = [0u8; PREFIX_LEN];
    reader
        .read_exact(&mut prefix)
        .map_err(|e| corrupt(format!("truncated before header: {e}")))?;
    let header_len = check_prefix(&prefix)?;

    let mut header_bytes = Vec::new();
    reader
        .by_ref()
        .take(header_len as u64)
        .read_to_end(&mut header_bytes)
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;
    if header_bytes.len() != header_len {
        return Err(corrupt(format!(
            "truncated header: {} of {header_len} bytes",
            header_bytes.len()
        )));
    }
    let header: CheckpointHeader = serde_json::from_slice(&header_bytes)
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?;
    Ok(header.summary())
}
