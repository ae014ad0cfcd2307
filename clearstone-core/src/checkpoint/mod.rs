//! Agent checkpoints
//!
//! A checkpoint freezes an agent's state at a chosen span of a recorded trace,
//! together with the spans around that point, so the execution can later be
//! rehydrated and replayed.
//!
//! Agents that implement [`Agent::get_state`] / [`Agent::load_state`] are
//! captured at full fidelity. Others fall back to a shallow snapshot of
//! [`Agent::public_fields`], which is flagged on the checkpoint.

pub mod agent;
pub mod format;
pub mod manager;
pub mod model;

pub use agent::{Agent, AgentFactory, AgentRegistry, AgentState, StateFidelity};
pub use format::{CHECKPOINT_MAGIC, FieldLayout};
pub use manager::{CHECKPOINT_EXTENSION, CheckpointManager};
pub use model::{CHECKPOINT_FORMAT_VERSION, Checkpoint, CheckpointSummary};
