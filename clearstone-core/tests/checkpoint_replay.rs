//! End-to-end tests: record a live run, checkpoint it, replay it
//!
//! An agent runs against live effect handlers while a tracer records every
//! call. The recorded trace is then checkpointed, written to disk, read back
//! and replayed without touching the live handlers.

use async_trait::async_trait;
use clearstone_core::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct TripPlanner {
    destination: String,
    itinerary: Vec<String>,
}

impl TripPlanner {
    fn capture(&self) -> Result<AgentState> {
        AgentState::new()
            .with("destination", &self.destination)?
            .with("itinerary", &self.itinerary)
    }

    fn restore(&mut self, state: &AgentState) -> Result<()> {
        self.destination = state.require("destination")?;
        self.itinerary = state.require("itinerary")?;
        Ok(())
    }
}

#[async_trait]
impl Agent for TripPlanner {
    fn get_state(&self) -> Option<Result<AgentState>> {
        Some(self.capture())
    }

    fn load_state(&mut self, state: &AgentState) -> Option<Result<()>> {
        Some(self.restore(state))
    }

    async fn call(&mut self, function: &str, input: Value, effects: &dyn Effects) -> anyhow::Result<Value> {
        anyhow::ensure!(function == "plan", "unknown function '{function}'");
        let days = input["days"].as_u64().unwrap_or(1);
        for day in 0..days {
            let stop = effects
                .invoke("llm", json!({ "destination": self.destination, "day": day }))
                .await?;
            self.itinerary.push(stop.as_str().unwrap_or_default().to_string());
        }
        let weather = effects.invoke("weather", json!({ "city": self.destination })).await?;
        Ok(json!({ "itinerary": self.itinerary, "weather": weather }))
    }
}

fn lisbon() -> TripPlanner {
    TripPlanner {
        destination: "Lisbon".to_string(),
        itinerary: Vec::new(),
    }
}

fn mocks() -> MockConfig {
    MockConfig::new().map("llm", "llm").map("weather", "weather")
}

struct Recorded {
    _dir: TempDir,
    provider: TracerProvider,
    trace: Trace,
    root_span_id: String,
    live_result: Value,
    live_calls: Arc<AtomicUsize>,
}

async fn record_live_run() -> Recorded {
    let dir = TempDir::new().unwrap();
    let config = TracingConfig::default()
        .with_storage_path(dir.path().join("traces.db"))
        .with_service_name("trip-planner")
        .with_flush_interval(Duration::from_millis(20));
    let provider = TracerProvider::new(config).unwrap();
    let tracer = provider.tracer("trip-planner", "1.0");

    let live_calls = Arc::new(AtomicUsize::new(0));
    let mut handlers = EffectRegistry::new();
    let calls = live_calls.clone();
    handlers.register("llm", "llm", move |input: Value| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, anyhow::Error>(json!(format!("stop-{}", input["day"]))) }
    });
    let calls = live_calls.clone();
    handlers.register("weather", "weather", move |_input: Value| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, anyhow::Error>(json!("sunny")) }
    });
    let live = LiveEffects::new(handlers).with_tracer(tracer.clone());

    let mut agent = lisbon();
    let agent_ref = &mut agent;
    let live_ref = &live;
    let (root_span_id, live_result) = tracer
        .in_span_async(SpanBuilder::new("plan_trip").kind(SpanKind::Server), |root| async move {
            let result = agent_ref.call("plan", json!({ "days": 2 }), live_ref).await?;
            Ok::<_, anyhow::Error>((root.span_id().to_string(), result))
        })
        .await
        .unwrap();
    provider.force_flush().await.unwrap();

    let root = provider
        .reader()
        .query_spans(&SpanQuery::new().name("plan_trip"))
        .unwrap()
        .remove(0);
    let trace = provider.reader().get_trace(&root.trace_id).unwrap();

    Recorded {
        _dir: dir,
        provider,
        trace,
        root_span_id,
        live_result,
        live_calls,
    }
}

fn registry() -> Arc<AgentRegistry> {
    let mut registry = AgentRegistry::new();
    registry.register::<TripPlanner>();
    Arc::new(registry)
}

#[tokio::test]
async fn test_live_run_records_effect_spans() {
    let recorded = record_live_run().await;
    assert_eq!(recorded.live_result["itinerary"], json!(["stop-0", "stop-1"]));
    assert_eq!(recorded.live_calls.load(Ordering::SeqCst), 3);

    let trace = &recorded.trace;
    assert_eq!(trace.spans.len(), 4);
    let children = trace.children(&recorded.root_span_id);
    let names: Vec<&str> = children.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["llm", "llm", "weather"]);
    assert!(children.iter().all(|s| s.kind == SpanKind::Client));
    recorded.provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_checkpoint_survives_disk_round_trip() {
    let recorded = record_live_run().await;
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(CheckpointConfig::default().with_checkpoint_dir(dir.path()))
        .with_registry(registry());

    let checkpoint = manager
        .create_checkpoint(&lisbon(), &recorded.trace, &recorded.root_span_id)
        .unwrap();
    let path = manager.save_checkpoint(&checkpoint, None).unwrap();
    assert_eq!(path.extension().unwrap(), "ckpt");

    let summary = manager.inspect_checkpoint(&path).unwrap();
    assert_eq!(summary.checkpoint_id, checkpoint.checkpoint_id);
    assert_eq!(summary.target_span_name.as_deref(), Some("plan_trip"));
    assert_eq!(summary.state_fidelity, StateFidelity::Full);
    assert_eq!(summary.context_span_count, 1);
    assert_eq!(summary.descendant_span_count, 3);

    let loaded = manager.load_checkpoint(&path).unwrap();
    assert_eq!(loaded.checkpoint_id, checkpoint.checkpoint_id);
    assert_eq!(loaded.target_span().unwrap().span_id, recorded.root_span_id);
    assert_eq!(loaded.agent_state, checkpoint.agent_state);
    assert_eq!(loaded.descendant_spans, checkpoint.descendant_spans);

    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&path, bytes).unwrap();
    assert!(matches!(
        manager.load_checkpoint(&path),
        Err(ClearstoneError::CorruptCheckpoint(_))
    ));

    let strict = CheckpointManager::new(
        CheckpointConfig::default()
            .with_checkpoint_dir(dir.path())
            .with_max_state_bytes(8),
    );
    assert!(matches!(
        strict.save_checkpoint(&checkpoint, None),
        Err(ClearstoneError::StateTooLarge { .. })
    ));
    recorded.provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_replay_reproduces_live_result_without_live_calls() {
    let recorded = record_live_run().await;
    let dir = TempDir::new().unwrap();
    let manager = CheckpointManager::new(CheckpointConfig::default().with_checkpoint_dir(dir.path()));
    let checkpoint = manager
        .create_checkpoint(&lisbon(), &recorded.trace, &recorded.root_span_id)
        .unwrap();
    let path = manager.save_checkpoint(&checkpoint, None).unwrap();
    let loaded = manager.load_checkpoint(&path).unwrap();

    let mut embedded = ReplayEngine::builder(loaded.clone())
        .registry(registry())
        .mock_config(mocks())
        .build()
        .unwrap();
    let mut from_store = ReplayEngine::builder(loaded)
        .registry(registry())
        .trace_reader(recorded.provider.reader())
        .mock_config(mocks())
        .build()
        .unwrap();

    let replayed = embedded.replay_from_checkpoint("plan", json!({ "days": 2 })).await.unwrap();
    assert_eq!(replayed, recorded.live_result);
    let replayed = from_store.replay_from_checkpoint("plan", json!({ "days": 2 })).await.unwrap();
    assert_eq!(replayed, recorded.live_result);
    assert_eq!(recorded.live_calls.load(Ordering::SeqCst), 3);

    let err = from_store
        .replay_from_checkpoint("plan", json!({ "days": 3 }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClearstoneError::MockExhausted { ref target, satisfied: 2 } if target == "llm"
    ));
    recorded.provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_breakpoint_on_effect_target() {
    let recorded = record_live_run().await;
    let checkpoint = CheckpointManager::new(CheckpointConfig::default())
        .create_checkpoint(&lisbon(), &recorded.trace, &recorded.root_span_id)
        .unwrap();
    let mut engine = ReplayEngine::builder(checkpoint)
        .registry(registry())
        .build()
        .unwrap();

    let mut controller = ScriptedController::new([
        StepCommand::Break("weather".to_string()),
        StepCommand::Continue,
        StepCommand::Continue,
    ]);
    let outcome = engine
        .start_debugging_session("plan", mocks(), json!({ "days": 2 }), &mut controller)
        .await
        .unwrap();
    assert_eq!(outcome.result.unwrap(), recorded.live_result);
    assert_eq!(outcome.preflight.depth("llm"), Some(2));
    assert_eq!(outcome.preflight.depth("weather"), Some(1));

    let pauses = controller.pauses();
    assert!(matches!(pauses[0], PausePoint::Entry { .. }));
    assert_eq!(
        pauses.last(),
        Some(&PausePoint::BeforeEffect {
            target: "weather".to_string(),
            call_index: 0,
            remaining: 1,
        })
    );
    assert!(!pauses.iter().any(|p| matches!(p, PausePoint::BeforeEffect { target, .. } if target == "llm")));
    recorded.provider.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_console_session_over_scripted_input() {
    let recorded = record_live_run().await;
    let checkpoint = CheckpointManager::new(CheckpointConfig::default())
        .create_checkpoint(&lisbon(), &recorded.trace, &recorded.root_span_id)
        .unwrap();
    let mut engine = ReplayEngine::builder(checkpoint)
        .registry(registry())
        .build()
        .unwrap();

    let mut transcript = Vec::new();
    let mut console = ConsoleController::new(std::io::Cursor::new("s\nc\n"), &mut transcript);
    let outcome = engine
        .start_debugging_session("plan", mocks(), json!({ "days": 1 }), &mut console)
        .await
        .unwrap();
    assert!(outcome.is_success());
    drop(console);

    let transcript = String::from_utf8(transcript).unwrap();
    assert!(transcript.contains("paused at entry of"));
    assert!(transcript.contains("before call #0 to 'llm'"));
    recorded.provider.shutdown().await.unwrap();
}
