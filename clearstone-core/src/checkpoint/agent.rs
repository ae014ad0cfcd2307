//! Checkpointable agents and their captured state

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::{ClearstoneError, Result};
use crate::replay::Effects;
use crate::serialization::HybridValue;

/// How faithfully a checkpoint's agent state was captured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFidelity {
    /// Captured through the agent's own state capture
    Full,
    /// Only the agent's public fields were recorded
    ShallowFields,
}

/// Named, individually encoded pieces of agent state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    fields: BTreeMap<String, HybridValue>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode and store a field, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Fails when the value cannot be encoded in either format.
    pub fn insert<T: Serialize + ?Sized>(&mut self, name: impl Into<String>, value: &T) -> Result<()> {
        self.fields.insert(name.into(), HybridValue::encode(value)?);
        Ok(())
    }

    /// Builder form of [`AgentState::insert`]
    pub fn with<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Result<Self> {
        self.insert(name, value)?;
        Ok(self)
    }

    pub fn insert_encoded(&mut self, name: impl Into<String>, value: HybridValue) {
        self.fields.insert(name.into(), value);
    }

    /// Decode a field, `None` when absent
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.fields.get(name).map(HybridValue::decode).transpose()
    }

    /// Decode a field that must be present
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        self.get(name)?
            .ok_or_else(|| ClearstoneError::Other(format!("agent state has no field '{name}'")))
    }

    pub fn encoded(&self, name: &str) -> Option<&HybridValue> {
        self.fields.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HybridValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Sum of the encoded sizes of all fields
    pub fn encoded_size(&self) -> usize {
        self.fields.values().map(HybridValue::encoded_len).sum()
    }
}

/// An agent whose execution can be checkpointed and replayed.
///
/// State capture is optional. Agents that do not implement [`Agent::get_state`]
/// are checkpointed from [`Agent::public_fields`] at shallow fidelity.
#[async_trait]
pub trait Agent: Send {
    /// Identifier used to find this agent's factory during rehydration
    fn class_id(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Full state capture, or `None` if the agent does not support it
    fn get_state(&self) -> Option<Result<AgentState>> {
        None
    }

    /// Restore state produced by [`Agent::get_state`], or `None` if unsupported
    fn load_state(&mut self, _state: &AgentState) -> Option<Result<()>> {
        None
    }

    /// Shallow snapshot of the agent's public data
    fn public_fields(&self) -> Result<AgentState> {
        Ok(AgentState::new())
    }

    /// Assign fields captured by [`Agent::public_fields`]
    fn restore_fields(&mut self, _fields: &AgentState) -> Result<()> {
        Ok(())
    }

    /// Run one of the agent's functions. All side effects go through `effects`.
    async fn call(&mut self, function: &str, input: Value, effects: &dyn Effects)
    -> anyhow::Result<Value>;
}

/// Builds a fresh, default-initialized agent
pub type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Maps agent class ids to factories for rehydration
#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("classes", &self.class_ids())
            .finish()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent type under its class id
    pub fn register<A: Agent + Default + 'static>(&mut self) -> &mut Self {
        let class_id = A::default().class_id();
        self.register_factory(class_id, || Box::new(A::default()) as Box<dyn Agent>)
    }

    pub fn register_factory<F>(&mut self, class_id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    {
        self.factories.insert(class_id.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, class_id: &str) -> bool {
        self.factories.contains_key(class_id)
    }

    pub fn class_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Build a fresh instance of a registered class.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAgentClass` when no factory is registered.
    pub fn instantiate(&self, class_id: &str) -> Result<Box<dyn Agent>> {
        self.factories
            .get(class_id)
            .map(|factory| factory())
            .ok_or_else(|| ClearstoneError::UnknownAgentClass(class_id.to_string()))
    }
}
