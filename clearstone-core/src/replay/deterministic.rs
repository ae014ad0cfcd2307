//! Deterministic effects for replay sessions
//!
//! Effect calls are answered from recorded outputs, the clock is frozen at the
//! checkpoint's creation time, and randomness comes from a generator seeded by
//! the checkpoint id. Every substitution is logged in order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::debugger::{PausePoint, StepController, Stepper};
use super::effects::Effects;
use super::mocks::MockSet;
use crate::error::{ClearstoneError, Result};

/// One value served in place of a live effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Substitution {
    Effect {
        target: String,
        index: usize,
        output: Value,
    },
    Clock {
        value: DateTime<Utc>,
    },
    Random {
        value: f64,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`Effects`] implementation that never touches the outside world
pub struct DeterministicExecutionContext<'a> {
    mocks: Mutex<MockSet>,
    clock: DateTime<Utc>,
    rng: Mutex<StdRng>,
    log: Mutex<Vec<Substitution>>,
    exhausted: Mutex<Option<(String, usize)>>,
    stepper: Option<tokio::sync::Mutex<Stepper<'a>>>,
}

impl<'a> DeterministicExecutionContext<'a> {
    pub(crate) fn new(
        mocks: MockSet,
        clock: DateTime<Utc>,
        seed: u64,
        controller: Option<&'a mut dyn StepController>,
    ) -> Self {
        Self {
            mocks: Mutex::new(mocks),
            clock,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            log: Mutex::new(Vec::new()),
            exhausted: Mutex::new(None),
            stepper: controller.map(|c| tokio::sync::Mutex::new(Stepper::new(c))),
        }
    }

    /// Pause at function entry when a controller is attached
    pub(crate) async fn pause_at_entry(&self, function: &str, agent_class: &str) -> Result<()> {
        if let Some(stepper) = &self.stepper {
            let point = PausePoint::Entry {
                function: function.to_string(),
                agent_class: agent_class.to_string(),
            };
            stepper.lock().await.pause(&point).await?;
        }
        Ok(())
    }

    /// Substitutions served so far, in order
    pub fn substitutions(&self) -> Vec<Substitution> {
        lock(&self.log).clone()
    }

    /// Target and satisfied count of the first exhausted queue, if any
    pub fn exhaustion(&self) -> Option<(String, usize)> {
        lock(&self.exhausted).clone()
    }

    async fn maybe_pause(&self, target: &str) -> Result<()> {
        let Some(stepper) = &self.stepper else {
            return Ok(());
        };
        let mut stepper = stepper.lock().await;
        if !stepper.should_pause_before(target) {
            return Ok(());
        }
        let (call_index, remaining) = {
            let mocks = lock(&self.mocks);
            mocks
                .queue(target)
                .map(|q| (q.served(), q.remaining()))
                .unwrap_or((0, 0))
        };
        let point = PausePoint::BeforeEffect {
            target: target.to_string(),
            call_index,
            remaining,
        };
        stepper.pause(&point).await
    }
}

#[async_trait]
impl<'a> Effects for DeterministicExecutionContext<'a> {
    async fn invoke(&self, target: &str, _input: Value) -> Result<Value> {
        self.maybe_pause(target).await?;

        let outcome = {
            let mut mocks = lock(&self.mocks);
            let queue = mocks
                .queue_mut(target)
                .ok_or_else(|| ClearstoneError::UnmappedTarget(target.to_string()))?;
            let index = queue.served();
            queue.next_output().map(|output| (index, output))
        };

        match outcome {
            Ok((index, output)) => {
                tracing::debug!(target_name = %target, index, "served recorded output");
                lock(&self.log).push(Substitution::Effect {
                    target: target.to_string(),
                    index,
                    output: output.clone(),
                });
                Ok(output)
            }
            Err(e) => {
                if let ClearstoneError::MockExhausted { target, satisfied } = &e {
                    lock(&self.exhausted).get_or_insert_with(|| (target.clone(), *satisfied));
                }
                Err(e)
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        lock(&self.log).push(Substitution::Clock { value: self.clock });
        self.clock
    }

    fn random(&self) -> f64 {
        let value = lock(&self.rng).gen_range(0.0..1.0);
        lock(&self.log).push(Substitution::Random { value });
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Span;
    use crate::observability::span::test_support::span;
    use crate::replay::debugger::{ScriptedController, StepCommand};
    use crate::replay::mocks::MockConfig;
    use crate::serialization::SnapshotCapture;
    use serde_json::json;

    fn mocks(outputs: &[&str]) -> MockSet {
        let spans: Vec<Span> = outputs
            .iter()
            .enumerate()
            .map(|(i, out)| {
                let mut s = span("t", &format!("llm{i}"), Some("root"), i as u64 + 1);
                s.operation_type = Some("llm".to_string());
                s.output_snapshot = Some(SnapshotCapture::default().capture(out));
                s
            })
            .collect();
        let refs: Vec<&Span> = spans.iter().collect();
        MockSet::build(&MockConfig::new().map("llm", "llm"), &refs)
    }

    fn clock() -> DateTime<Utc> {
        "2024-01-02T03:04:05Z".parse().unwrap()
    }

    #[tokio::test]
    async fn test_serves_outputs_then_exhausts() {
        let cx = DeterministicExecutionContext::new(mocks(&["A", "B"]), clock(), 7, None);
        assert_eq!(cx.invoke("llm", Value::Null).await.unwrap(), json!("A"));
        assert_eq!(cx.invoke("llm", Value::Null).await.unwrap(), json!("B"));

        let err = cx.invoke("llm", Value::Null).await.unwrap_err();
        assert!(matches!(err, ClearstoneError::MockExhausted { satisfied: 2, .. }));
        assert_eq!(cx.exhaustion(), Some(("llm".to_string(), 2)));

        let unmapped = cx.invoke("search", Value::Null).await.unwrap_err();
        assert!(matches!(unmapped, ClearstoneError::UnmappedTarget(_)));
    }

    #[tokio::test]
    async fn test_clock_and_random_are_reproducible() {
        let a = DeterministicExecutionContext::new(MockSet::default(), clock(), 42, None);
        let b = DeterministicExecutionContext::new(MockSet::default(), clock(), 42, None);

        assert_eq!(a.now(), clock());
        let draws_a: Vec<f64> = (0..5).map(|_| a.random()).collect();
        let draws_b: Vec<f64> = (0..5).map(|_| b.random()).collect();
        assert_eq!(draws_a, draws_b);
        assert!(draws_a.iter().all(|v| (0.0..1.0).contains(v)));

        assert_eq!(a.substitutions()[0], Substitution::Clock { value: clock() });
        assert_eq!(a.substitutions().len(), 6);
    }

    #[tokio::test]
    async fn test_stepping_pauses_before_each_effect() {
        let mut controller = ScriptedController::new([StepCommand::Step, StepCommand::Step]);
        {
            let cx = DeterministicExecutionContext::new(
                mocks(&["A", "B"]),
                clock(),
                1,
                Some(&mut controller),
            );
            cx.pause_at_entry("run", "demo::Agent").await.unwrap();
            cx.invoke("llm", Value::Null).await.unwrap();
            cx.invoke("llm", Value::Null).await.unwrap();
        }

        let pauses = controller.pauses();
        assert_eq!(pauses.len(), 3);
        assert!(matches!(pauses[0], PausePoint::Entry { .. }));
        assert_eq!(
            pauses[2],
            PausePoint::BeforeEffect {
                target: "llm".to_string(),
                call_index: 1,
                remaining: 1
            }
        );
    }
}
