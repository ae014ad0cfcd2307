//! Tracer provider
//!
//! Owns the span buffer and the store behind it, and hands out [`Tracer`]s
//! that share them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use super::tracer::Tracer;
use crate::config::TracingConfig;
use crate::error::Result;
use crate::serialization::SnapshotCapture;
use crate::storage::{
    BufferConfig, BufferStats, FlushErrorHook, InMemoryTraceStore, SpanBuffer, SpanWriter,
    TraceReader, TraceStore,
};

/// Entry point for tracing: configuration, export pipeline and tracer registry
pub struct TracerProvider {
    config: TracingConfig,
    buffer: Arc<SpanBuffer>,
    reader: Arc<dyn TraceReader>,
    tracers: Mutex<HashMap<(String, String), Tracer>>,
}

impl std::fmt::Debug for TracerProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerProvider")
            .field("config", &self.config)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl TracerProvider {
    /// Open the SQLite store named by `config.storage_path` and start exporting.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid settings, an unopenable store, or a missing runtime.
    pub fn new(config: TracingConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(TraceStore::open(&config.storage_path)?);
        Self::with_store(config, store)
    }

    /// Export to an explicit store
    pub fn with_store<S>(config: TracingConfig, store: Arc<S>) -> Result<Self>
    where
        S: SpanWriter + TraceReader,
    {
        config.validate()?;

        let reader: Arc<dyn TraceReader> = store.clone();
        let writer: Arc<dyn SpanWriter> = store;
        let buffer = Arc::new(SpanBuffer::new(writer, BufferConfig::from(&config))?);

        tracing::info!(
            service = %config.service_name,
            storage = %config.storage_path.display(),
            batch_size = config.batch_size,
            "tracer provider started"
        );

        Ok(Self {
            config,
            buffer,
            reader,
            tracers: Mutex::new(HashMap::new()),
        })
    }

    /// Provider backed by an [`InMemoryTraceStore`]
    pub fn in_memory(service_name: impl Into<String>) -> Result<Self> {
        let config = TracingConfig::default().with_service_name(service_name);
        Self::with_store(config, Arc::new(InMemoryTraceStore::new()))
    }

    /// Tracer for an instrumentation scope. Repeated calls return the same tracer.
    pub fn tracer(&self, name: impl Into<String>, version: impl Into<String>) -> Tracer {
        let key = (name.into(), version.into());
        let mut tracers = self.tracers.lock().unwrap_or_else(PoisonError::into_inner);
        tracers
            .entry(key.clone())
            .or_insert_with(|| {
                Tracer::new(
                    key.0,
                    key.1,
                    self.config.service_name.clone(),
                    self.buffer.clone(),
                    SnapshotCapture::new(self.config.max_snapshot_bytes),
                )
            })
            .clone()
    }

    pub fn config(&self) -> &TracingConfig {
        &self.config
    }

    /// Read access to the stored traces
    pub fn reader(&self) -> Arc<dyn TraceReader> {
        self.reader.clone()
    }

    pub fn set_error_hook(&self, hook: FlushErrorHook) {
        self.buffer.set_error_hook(hook);
    }

    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Write all buffered spans
    pub async fn force_flush(&self) -> Result<()> {
        self.buffer.flush().await
    }

    /// Flush and stop exporting. Spans closed afterwards are rejected.
    pub async fn shutdown(&self) -> Result<()> {
        self.buffer.shutdown().await?;
        tracing::info!(service = %self.config.service_name, "tracer provider shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClearstoneError;
    use crate::observability::{SpanBuilder, SpanKind};
    use crate::storage::TraceFilter;

    #[tokio::test]
    async fn test_tracer_is_cached_per_scope() {
        let provider = TracerProvider::in_memory("svc").unwrap();
        let a = provider.tracer("agent", "1.0");
        let b = provider.tracer("agent", "1.0");
        let c = provider.tracer("agent", "2.0");
        assert_eq!(a.scope(), b.scope());
        assert_ne!(a.scope(), c.scope());
        assert_eq!(provider.tracers.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_spans_reach_store_after_shutdown() {
        let provider = TracerProvider::in_memory("svc").unwrap();
        let tracer = provider.tracer("agent", "1.0");
        {
            let _root = tracer.span("root", SpanKind::Server, Default::default());
            let _child = tracer.start(SpanBuilder::new("child"));
        }
        provider.shutdown().await.unwrap();

        let summaries = provider.reader().list_traces(10, &TraceFilter::new()).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].span_count, 2);
        assert_eq!(summaries[0].root_name.as_deref(), Some("root"));
        assert_eq!(summaries[0].service_name, "svc");
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = TracingConfig::default().with_batch_size(0);
        let result = TracerProvider::with_store(config, Arc::new(InMemoryTraceStore::new()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_creates_no_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("traces.db");
        let config = TracingConfig::default()
            .with_storage_path(&path)
            .with_batch_size(0);

        let result = TracerProvider::new(config);
        assert!(matches!(result, Err(ClearstoneError::Configuration(_))));
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn test_sqlite_provider_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = TracingConfig::default().with_storage_path(dir.path().join("traces.db"));
        let provider = TracerProvider::new(config).unwrap();
        let tracer = provider.tracer("agent", "1.0");
        let trace_id = {
            let root = tracer.span("root", SpanKind::Internal, Default::default());
            root.trace_id().to_string()
        };
        provider.force_flush().await.unwrap();

        let trace = provider.reader().get_trace(&trace_id).unwrap();
        assert_eq!(trace.spans.len(), 1);
        provider.shutdown().await.unwrap();
    }
}
