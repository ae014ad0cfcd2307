//! The side-effect seam
//!
//! Agent code performs every external call, clock read and random draw through
//! [`Effects`]. Live runs use [`LiveEffects`]; replays swap in the deterministic
//! context, so agent code never needs to know which mode it is in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{ClearstoneError, Result};
use crate::observability::{SpanBuilder, SpanKind, Tracer};

/// Side effects available to agent code
#[async_trait]
pub trait Effects: Send + Sync {
    /// Invoke an external dependency by target name
    async fn invoke(&self, target: &str, input: Value) -> Result<Value>;

    /// Current time
    fn now(&self) -> DateTime<Utc>;

    /// Uniform random number in `[0, 1)`
    fn random(&self) -> f64;
}

/// Async handler for a live effect
pub type EffectHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone)]
struct RegisteredEffect {
    operation_type: String,
    handler: EffectHandler,
}

/// Live handlers keyed by target name
#[derive(Clone, Default)]
pub struct EffectRegistry {
    effects: HashMap<String, RegisteredEffect>,
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut targets: Vec<_> = self.effects.keys().collect();
        targets.sort();
        f.debug_struct("EffectRegistry")
            .field("targets", &targets)
            .finish()
    }
}

impl EffectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Spans recorded for it carry `operation_type`.
    pub fn register<F, Fut>(
        &mut self,
        target: impl Into<String>,
        operation_type: impl Into<String>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: EffectHandler =
            Arc::new(move |input| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(handler(input))
            });
        self.effects.insert(
            target.into(),
            RegisteredEffect {
                operation_type: operation_type.into(),
                handler,
            },
        );
        self
    }

    pub fn operation_type(&self, target: &str) -> Option<&str> {
        self.effects.get(target).map(|e| e.operation_type.as_str())
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.effects.keys().map(String::as_str)
    }
}

/// Effects that really happen, optionally recorded as client spans
#[derive(Debug, Clone)]
pub struct LiveEffects {
    registry: Arc<EffectRegistry>,
    tracer: Option<Tracer>,
}

impl LiveEffects {
    pub fn new(registry: EffectRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            tracer: None,
        }
    }

    /// Record each invocation as a span with its input and output
    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = Some(tracer);
        self
    }
}

#[async_trait]
impl Effects for LiveEffects {
    async fn invoke(&self, target: &str, input: Value) -> Result<Value> {
        let effect = self
            .registry
            .effects
            .get(target)
            .ok_or_else(|| ClearstoneError::UnmappedTarget(target.to_string()))?;
        let handler = effect.handler.clone();

        let Some(tracer) = &self.tracer else {
            return handler(input).await.map_err(|error| ClearstoneError::Effect {
                target: target.to_string(),
                error,
            });
        };

        let builder = SpanBuilder::new(target)
            .kind(SpanKind::Client)
            .operation_type(effect.operation_type.clone())
            .attribute("effect.target", target);

        tracer
            .in_span_async(builder, |span| async move {
                if let Err(e) = span.record_input(&input) {
                    tracing::debug!(error = %e, "could not record effect input");
                }
                let output = handler(input).await.map_err(|error| ClearstoneError::Effect {
                    target: target.to_string(),
                    error,
                })?;
                if let Err(e) = span.record_output(&output) {
                    tracing::debug!(error = %e, "could not record effect output");
                }
                Ok::<_, ClearstoneError>(output)
            })
            .await
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn random(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}
