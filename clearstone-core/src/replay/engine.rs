//! Replay engine
//!
//! Rehydrates the agent captured in a [`Checkpoint`], installs recorded outputs
//! behind the [`Effects`](super::Effects) seam and runs one of the agent's
//! functions against them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::debugger::StepController;
use super::deterministic::{DeterministicExecutionContext, Substitution};
use super::mocks::{MockConfig, MockSet, MockSource, PreflightReport};
use crate::checkpoint::{Agent, AgentRegistry, Checkpoint, StateFidelity};
use crate::error::{ClearstoneError, Result};
use crate::observability::Span;
use crate::storage::TraceReader;

/// Lifecycle of a replay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayState {
    Idle,
    Rehydrated,
    MocksInstalled,
    Running,
    Completed,
    Failed,
    MocksRestored,
}

impl ReplayState {
    fn can_advance_to(self, next: ReplayState) -> bool {
        use ReplayState::*;
        matches!(
            (self, next),
            (Idle | MocksRestored, Rehydrated)
                | (Rehydrated, MocksInstalled)
                | (MocksInstalled, Running)
                | (Running, Completed | Failed)
                | (Rehydrated | MocksInstalled, Failed)
                | (Completed | Failed, MocksRestored)
        )
    }
}

impl std::fmt::Display for ReplayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReplayState::Idle => "IDLE",
            ReplayState::Rehydrated => "REHYDRATED",
            ReplayState::MocksInstalled => "MOCKS_INSTALLED",
            ReplayState::Running => "RUNNING",
            ReplayState::Completed => "COMPLETED",
            ReplayState::Failed => "FAILED",
            ReplayState::MocksRestored => "MOCKS_RESTORED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct SessionTracker {
    state: ReplayState,
    transitions: Vec<ReplayState>,
}

impl SessionTracker {
    fn advance(&mut self, next: ReplayState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(ClearstoneError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.record(next);
        Ok(())
    }

    fn record(&mut self, next: ReplayState) {
        tracing::trace!(from = %self.state, to = %next, "replay state change");
        self.state = next;
        self.transitions.push(next);
    }
}

fn lock(tracker: &Mutex<SessionTracker>) -> MutexGuard<'_, SessionTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the session's seams however the session ends.
///
/// Dropping it before the session reached a terminal state marks the session
/// failed first, so cancellation and panics still end in `MOCKS_RESTORED`.
struct SeamGuard<'e> {
    tracker: &'e Mutex<SessionTracker>,
}

impl<'e> SeamGuard<'e> {
    fn advance(&self, next: ReplayState) -> Result<()> {
        lock(self.tracker).advance(next)
    }
}

impl Drop for SeamGuard<'_> {
    fn drop(&mut self) {
        let mut tracker = lock(self.tracker);
        if !matches!(tracker.state, ReplayState::Completed | ReplayState::Failed) {
            tracker.record(ReplayState::Failed);
        }
        tracker.record(ReplayState::MocksRestored);
    }
}

/// Result of one replay session
#[derive(Debug)]
pub struct ReplayOutcome {
    /// What the replayed function returned
    pub result: Result<Value>,
    /// Queue depths before the function ran
    pub preflight: PreflightReport,
    /// Every substituted value, in the order it was served
    pub substitutions: Vec<Substitution>,
    /// States visited by this session
    pub transitions: Vec<ReplayState>,
}

impl ReplayOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Builder for [`ReplayEngine`]
pub struct ReplayEngineBuilder {
    checkpoint: Checkpoint,
    registry: Option<Arc<AgentRegistry>>,
    reader: Option<Arc<dyn TraceReader>>,
    mock_config: MockConfig,
}

impl ReplayEngineBuilder {
    pub fn registry(mut self, registry: Arc<AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Read recorded outputs from the full trace instead of the checkpoint
    pub fn trace_reader(mut self, reader: Arc<dyn TraceReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Mocks used by [`ReplayEngine::replay_from_checkpoint`]
    pub fn mock_config(mut self, config: MockConfig) -> Self {
        self.mock_config = config;
        self
    }

    /// # Errors
    ///
    /// `Configuration` when no registry was supplied, `UnknownAgentClass` when
    /// the registry cannot build the checkpoint's agent.
    pub fn build(self) -> Result<ReplayEngine> {
        let registry = self.registry.ok_or_else(|| {
            ClearstoneError::Configuration("replay engine requires an agent registry".to_string())
        })?;
        if !registry.contains(&self.checkpoint.agent_class) {
            return Err(ClearstoneError::UnknownAgentClass(
                self.checkpoint.agent_class.clone(),
            ));
        }
        if self.checkpoint.state_fidelity == StateFidelity::ShallowFields {
            tracing::warn!(
                checkpoint_id = %self.checkpoint.checkpoint_id,
                agent_class = %self.checkpoint.agent_class,
                "checkpoint holds shallow field state; private agent state will not be restored"
            );
        }
        Ok(ReplayEngine {
            checkpoint: self.checkpoint,
            registry,
            reader: self.reader,
            mock_config: self.mock_config,
            tracker: Mutex::new(SessionTracker {
                state: ReplayState::Idle,
                transitions: Vec::new(),
            }),
        })
    }
}

/// Replays agent functions from a checkpoint.
///
/// One engine runs one session at a time. Every session starts from a fresh
/// rehydration, so repeated sessions see identical agent state and identical
/// substituted values.
pub struct ReplayEngine {
    checkpoint: Checkpoint,
    registry: Arc<AgentRegistry>,
    reader: Option<Arc<dyn TraceReader>>,
    mock_config: MockConfig,
    tracker: Mutex<SessionTracker>,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("checkpoint_id", &self.checkpoint.checkpoint_id)
            .field("agent_class", &self.checkpoint.agent_class)
            .field("mock_source", &self.mock_source())
            .field("state", &self.state())
            .finish()
    }
}

impl ReplayEngine {
    pub fn builder(checkpoint: Checkpoint) -> ReplayEngineBuilder {
        ReplayEngineBuilder {
            checkpoint,
            registry: None,
            reader: None,
            mock_config: MockConfig::default(),
        }
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn state(&self) -> ReplayState {
        lock(&self.tracker).state
    }

    pub fn mock_source(&self) -> MockSource {
        if self.reader.is_some() {
            MockSource::Store
        } else {
            MockSource::Embedded
        }
    }

    /// Build a fresh agent carrying the checkpoint's state.
    ///
    /// Full-fidelity state goes through [`Agent::load_state`], falling back to
    /// [`Agent::restore_fields`] when the agent cannot load it.
    pub fn rehydrate(&self) -> Result<Box<dyn Agent>> {
        let mut agent = self.registry.instantiate(&self.checkpoint.agent_class)?;
        let state = &self.checkpoint.agent_state;
        match self.checkpoint.state_fidelity {
            StateFidelity::Full => match agent.load_state(state) {
                Some(loaded) => loaded?,
                None => {
                    tracing::warn!(
                        agent_class = %self.checkpoint.agent_class,
                        "agent cannot load captured state; restoring fields directly"
                    );
                    agent.restore_fields(state)?;
                }
            },
            StateFidelity::ShallowFields => agent.restore_fields(state)?,
        }
        Ok(agent)
    }

    /// Queue depths for the engine's mock configuration
    pub async fn preflight(&self) -> Result<PreflightReport> {
        let mocks = self.build_mocks(&self.mock_config).await?;
        Ok(mocks.preflight(self.mock_source()))
    }

    /// Run `function` to completion with the engine's mock configuration.
    ///
    /// # Errors
    ///
    /// Returns the function's own error, `MockExhausted` when it calls a target
    /// whose recorded outputs ran out, or any rehydration failure.
    pub async fn replay_from_checkpoint(&mut self, function: &str, input: Value) -> Result<Value> {
        let config = self.mock_config.clone();
        self.run_session(function, &config, input, None).await?.result
    }

    /// Run `function` under a step controller.
    ///
    /// The session pauses before the function runs and then wherever the
    /// controller steps or sets breakpoints. Failures of the replayed code,
    /// including an abort, are reported in [`ReplayOutcome::result`].
    ///
    /// # Errors
    ///
    /// Fails before the session starts when the agent cannot be rehydrated or
    /// the trace cannot be loaded.
    pub async fn start_debugging_session(
        &mut self,
        function: &str,
        mock_config: MockConfig,
        input: Value,
        controller: &mut dyn StepController,
    ) -> Result<ReplayOutcome> {
        self.run_session(function, &mock_config, input, Some(controller))
            .await
    }

    async fn run_session(
        &self,
        function: &str,
        mock_config: &MockConfig,
        input: Value,
        controller: Option<&mut dyn StepController>,
    ) -> Result<ReplayOutcome> {
        let mut agent = self.rehydrate()?;
        {
            let mut tracker = lock(&self.tracker);
            tracker.transitions.clear();
            tracker.advance(ReplayState::Rehydrated)?;
        }
        let guard = SeamGuard {
            tracker: &self.tracker,
        };

        let mocks = self.build_mocks(mock_config).await?;
        let preflight = mocks.preflight(self.mock_source());
        for target in preflight.empty_targets() {
            tracing::warn!(target_name = %target, "no recorded outputs for substitution target");
        }

        let context = DeterministicExecutionContext::new(
            mocks,
            self.checkpoint.created_at,
            self.checkpoint.replay_seed(),
            controller,
        );
        guard.advance(ReplayState::MocksInstalled)?;
        guard.advance(ReplayState::Running)?;

        tracing::info!(
            checkpoint_id = %self.checkpoint.checkpoint_id,
            function,
            mock_source = ?self.mock_source(),
            "replay session started"
        );

        let result = match context
            .pause_at_entry(function, &self.checkpoint.agent_class)
            .await
        {
            Ok(()) => agent
                .call(function, input, &context)
                .await
                .map_err(ClearstoneError::from),
            Err(e) => Err(e),
        };
        let result = match (result, context.exhaustion()) {
            (Err(e), Some((target, satisfied)))
                if !matches!(e, ClearstoneError::MockExhausted { .. }) =>
            {
                tracing::debug!(error = %e, "replayed function failed after a mock ran out");
                Err(ClearstoneError::MockExhausted { target, satisfied })
            }
            (result, _) => result,
        };

        match &result {
            Ok(_) => guard.advance(ReplayState::Completed)?,
            Err(e) => {
                tracing::info!(error = %e, function, "replayed function failed");
                guard.advance(ReplayState::Failed)?;
            }
        }
        let substitutions = context.substitutions();
        drop(context);
        drop(guard);

        Ok(ReplayOutcome {
            result,
            preflight,
            substitutions,
            transitions: lock(&self.tracker).transitions.clone(),
        })
    }

    async fn build_mocks(&self, config: &MockConfig) -> Result<MockSet> {
        let Some(reader) = &self.reader else {
            return Ok(MockSet::build(config, &self.checkpoint.embedded_spans()));
        };

        let reader = Arc::clone(reader);
        let trace_id = self.checkpoint.trace_id.clone();
        let trace = tokio::task::spawn_blocking(move || reader.get_trace(&trace_id))
            .await
            .map_err(|e| ClearstoneError::Other(format!("trace load task failed: {e}")))??;
        let spans: Vec<&Span> = trace.spans.iter().collect();
        Ok(MockSet::build(config, &spans))
    }
}
