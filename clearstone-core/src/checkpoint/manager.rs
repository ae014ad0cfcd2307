//! Checkpoint creation and persistence

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::agent::{Agent, AgentRegistry, StateFidelity};
use super::format;
use super::model::{CHECKPOINT_FORMAT_VERSION, Checkpoint, CheckpointSummary};
use crate::config::CheckpointConfig;
use crate::error::{ClearstoneError, Result};
use crate::observability::Trace;

/// File extension for checkpoint artifacts
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Creates, saves and loads checkpoints
#[derive(Debug, Clone, Default)]
pub struct CheckpointManager {
    config: CheckpointConfig,
    registry: Option<Arc<AgentRegistry>>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            registry: None,
        }
    }

    /// Validate agent classes against `registry` when loading
    pub fn with_registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Capture `agent` at `span_id` of `trace`.
    ///
    /// # Errors
    ///
    /// Returns `TargetSpanNotFound` if the span is not in the trace, or the
    /// agent's own error if state capture fails.
    pub fn create_checkpoint(
        &self,
        agent: &dyn Agent,
        trace: &Trace,
        span_id: &str,
    ) -> Result<Checkpoint> {
        let target = trace
            .span(span_id)
            .ok_or_else(|| ClearstoneError::TargetSpanNotFound {
                trace_id: trace.trace_id.clone(),
                span_id: span_id.to_string(),
            })?;

        let mut trace_context: Vec<_> = trace.ancestors(span_id).into_iter().cloned().collect();
        trace_context.push(target.clone());
        let descendant_spans = trace.descendants(span_id).into_iter().cloned().collect();

        let agent_class = agent.class_id().to_string();
        let (agent_state, state_fidelity) = match agent.get_state() {
            Some(state) => (state?, StateFidelity::Full),
            None => {
                tracing::warn!(
                    agent_class = %agent_class,
                    "agent has no state capture; checkpoint holds a shallow copy of its public fields"
                );
                (agent.public_fields()?, StateFidelity::ShallowFields)
            }
        };

        let checkpoint = Checkpoint {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            trace_id: trace.trace_id.clone(),
            target_span_id: span_id.to_string(),
            agent_class,
            agent_state,
            state_fidelity,
            trace_context,
            descendant_spans,
            format_version: CHECKPOINT_FORMAT_VERSION,
            library_version: crate::VERSION.to_string(),
        };

        tracing::info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            trace_id = %checkpoint.trace_id,
            span_id = %span_id,
            fidelity = ?checkpoint.state_fidelity,
            "created checkpoint"
        );
        Ok(checkpoint)
    }

    /// Default location: `<checkpoint_dir>/<trace_id>_<checkpoint_id>.ckpt`
    pub fn default_path(&self, checkpoint: &Checkpoint) -> PathBuf {
        self.config.checkpoint_dir.join(format!(
            "{}_{}.{CHECKPOINT_EXTENSION}",
            checkpoint.trace_id, checkpoint.checkpoint_id
        ))
    }

    /// Write a checkpoint artifact, returning the path written.
    ///
    /// The file is written next to its destination and renamed into place,
    /// so a reader never sees a partial artifact.
    ///
    /// # Errors
    ///
    /// Returns `StateTooLarge` when the encoded state exceeds the configured
    /// limit, or an I/O error.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint, path: Option<&Path>) -> Result<PathBuf> {
        let size = checkpoint.agent_state.encoded_size();
        if size > self.config.max_state_bytes {
            return Err(ClearstoneError::StateTooLarge {
                size,
                limit: self.config.max_state_bytes,
            });
        }

        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(checkpoint));
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = format::encode(checkpoint)?;
        let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        tracing::info!(
            checkpoint_id = %checkpoint.checkpoint_id,
            path = %path.display(),
            bytes = bytes.len(),
            "saved checkpoint"
        );
        Ok(path)
    }

    /// Load and verify a checkpoint artifact.
    ///
    /// # Errors
    ///
    /// Returns `CorruptCheckpoint` for damaged files and `UnknownAgentClass`
    /// when a registry is attached and does not know the agent class.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let checkpoint = format::decode(&bytes)?;

        if let Some(registry) = &self.registry {
            if !registry.contains(&checkpoint.agent_class) {
                return Err(ClearstoneError::UnknownAgentClass(checkpoint.agent_class));
            }
        }

        tracing::debug!(
            checkpoint_id = %checkpoint.checkpoint_id,
            path = %path.display(),
            "loaded checkpoint"
        );
        Ok(checkpoint)
    }

    /// Read checkpoint metadata without decoding the agent state
    pub fn inspect_checkpoint(&self, path: impl AsRef<Path>) -> Result<CheckpointSummary> {
        let file = std::fs::File::open(path.as_ref())?;
        format::read_summary(std::io::BufReader::new(file))
    }
}
