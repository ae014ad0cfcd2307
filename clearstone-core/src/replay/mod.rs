//! Deterministic replay of checkpointed agents
//!
//! A replay rehydrates the agent stored in a checkpoint and runs one of its
//! functions with every side effect answered from the recorded trace:
//!
//! - effect calls pop the next recorded output for their target
//! - `now()` returns the checkpoint's creation time
//! - `random()` draws from a generator seeded by the checkpoint id
//!
//! Agent code reaches the outside world only through [`Effects`], so the same
//! code runs live with [`LiveEffects`] and replayed with the deterministic
//! context.
//!
//! # Example
//!
//! ```rust,no_run
//! use clearstone_core::checkpoint::{AgentRegistry, CheckpointManager};
//! use clearstone_core::config::CheckpointConfig;
//! use clearstone_core::replay::{MockConfig, ReplayEngine, ScriptedController};
//! use std::sync::Arc;
//!
//! # async fn example(registry: Arc<AgentRegistry>) -> clearstone_core::Result<()> {
//! let manager = CheckpointManager::new(CheckpointConfig::default());
//! let checkpoint = manager.load_checkpoint("run.ckpt")?;
//!
//! let mut engine = ReplayEngine::builder(checkpoint)
//!     .registry(registry)
//!     .mock_config(MockConfig::new().map("llm", "llm"))
//!     .build()?;
//!
//! let answer = engine.replay_from_checkpoint("run", serde_json::json!({})).await?;
//!
//! let mut controller = ScriptedController::default();
//! let outcome = engine
//!     .start_debugging_session("run", MockConfig::new().map("llm", "llm"), serde_json::json!({}), &mut controller)
//!     .await?;
//! println!("{answer} / {} substitutions", outcome.substitutions.len());
//! # Ok(())
//! # }
//! ```

mod debugger;
mod deterministic;
mod effects;
mod engine;
mod mocks;

pub use debugger::{ConsoleController, PausePoint, ScriptedController, StepCommand, StepController};
pub use deterministic::{DeterministicExecutionContext, Substitution};
pub use effects::{EffectHandler, EffectRegistry, Effects, LiveEffects};
pub use engine::{ReplayEngine, ReplayEngineBuilder, ReplayOutcome, ReplayState};
pub use mocks::{MockConfig, MockQueue, MockSet, MockSource, PreflightEntry, PreflightReport};
