//! # Clearstone - Time-Travel Debugging for AI Agents
//!
//! Clearstone records what an agent did, freezes it at any point, and runs it
//! again deterministically:
//! - Span tracing with batched export to SQLite (WAL mode)
//! - Checkpoints of agent state at a chosen span, with the surrounding trace
//! - Replay that answers every side effect from the recorded trace
//! - Step-through debugging sessions with breakpoints on effect targets
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clearstone_core::prelude::*;
//! use serde_json::{Value, json};
//!
//! #[derive(Default)]
//! struct Summarizer {
//!     notes: Vec<String>,
//! }
//!
//! #[async_trait::async_trait]
//! impl Agent for Summarizer {
//!     fn public_fields(&self) -> Result<AgentState> {
//!         AgentState::new().with("notes", &self.notes)
//!     }
//!
//!     async fn call(&mut self, _function: &str, input: Value, effects: &dyn Effects) -> anyhow::Result<Value> {
//!         let summary = effects.invoke("llm", input).await?;
//!         self.notes.push(summary.to_string());
//!         Ok(summary)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let provider = TracerProvider::new(TracingConfig::default())?;
//!     let tracer = provider.tracer("summarizer", "1.0");
//!
//!     let mut effects = EffectRegistry::new();
//!     effects.register("llm", "llm", |input: Value| async move { Ok::<_, anyhow::Error>(json!({ "summary": input })) });
//!     let live = LiveEffects::new(effects).with_tracer(tracer.clone());
//!
//!     let mut agent = Summarizer::default();
//!     let guard = tracer.start(SpanBuilder::new("summarize"));
//!     let trace_id = guard.trace_id().to_string();
//!     let span_id = guard.span_id().to_string();
//!     agent.call("summarize", json!("long text"), &live).await?;
//!     guard.end();
//!     provider.force_flush().await?;
//!
//!     let trace = provider.reader().get_trace(&trace_id)?;
//!     let manager = CheckpointManager::new(CheckpointConfig::default());
//!     let checkpoint = manager.create_checkpoint(&agent, &trace, &span_id)?;
//!
//!     let mut registry = AgentRegistry::new();
//!     registry.register::<Summarizer>();
//!     let mut engine = ReplayEngine::builder(checkpoint)
//!         .registry(std::sync::Arc::new(registry))
//!         .trace_reader(provider.reader())
//!         .mock_config(MockConfig::new().map("llm", "llm"))
//!         .build()?;
//!     let replayed = engine.replay_from_checkpoint("summarize", json!("long text")).await?;
//!     println!("{replayed}");
//!
//!     provider.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **observability**: tracer, spans, context-local nesting, provider
//! - **storage**: span buffer, retrying flushes, SQLite and in-memory stores
//! - **serialization**: JSON-first values with a MessagePack fallback
//! - **checkpoint**: agent state capture and the checkpoint artifact format
//! - **replay**: the effects seam, recorded-output mocks, replay engine and
//!   step controllers

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod observability;
pub mod replay;
pub mod serialization;
pub mod storage;

pub use error::{ClearstoneError, Result};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{
        Agent, AgentRegistry, AgentState, Checkpoint, CheckpointManager, CheckpointSummary,
        StateFidelity,
    };
    pub use crate::config::{CheckpointConfig, ClearstoneConfig, TracingConfig};
    pub use crate::error::{ClearstoneError, Result};
    pub use crate::observability::{
        AttributeValue, Attributes, Span, SpanBuilder, SpanGuard, SpanHandle, SpanKind,
        SpanStatus, Trace, TraceSummary, Tracer, TracerProvider, current_span, with_span_context,
    };
    pub use crate::replay::{
        ConsoleController, EffectRegistry, Effects, LiveEffects, MockConfig, MockSource,
        PausePoint, PreflightReport, ReplayEngine, ReplayOutcome, ReplayState, ScriptedController,
        StepCommand, StepController, Substitution,
    };
    pub use crate::serialization::{HybridValue, Snapshot, SnapshotCapture};
    pub use crate::storage::{
        InMemoryTraceStore, SpanQuery, SpanWriter, TraceFilter, TraceReader, TraceStore,
    };
}
