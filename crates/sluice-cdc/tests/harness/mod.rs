//! Test harness for pipeline integration tests
//!
//! Shared handlers, polling helpers and a service builder wired to the
//! in-memory change source.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_cdc::common::{
    BindingConfig, ChangeDataCaptureService, ChangeEvent, ChangeHandler, ChangeSource,
    ChangeStream, HandlerRegistry, MemoryChangeSource, PipelineConfig, PipelineConfigBuilder,
    ResumeToken, SharedResumeTokenStore,
};
use sluice_cdc::{CdcError, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("sluice_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Upper bound for any single wait in these tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`wait_until`] for conditions that need `.await`.
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler that records every event it sees, with the target table.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(ChangeEvent, String)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn events_for(&self, entity_type: &str) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(e, _)| e.entity_type == entity_type)
            .map(|(e, _)| e.clone())
            .collect()
    }

    pub fn tables(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Wait until at least `n` events have been recorded.
    pub async fn wait_for(&self, n: usize) -> bool {
        wait_until(WAIT_TIMEOUT, || self.count() >= n).await
    }

    /// Tokens of the streamed events for one entity type, in handling order.
    pub fn tokens_for(&self, entity_type: &str) -> Vec<ResumeToken> {
        self.events_for(entity_type)
            .into_iter()
            .filter_map(|e| e.resume_token)
            .collect()
    }
}

#[async_trait]
impl ChangeHandler for RecordingHandler {
    async fn handle_change(
        &self,
        event: &ChangeEvent,
        table_name: &str,
        _fields: &[String],
    ) -> Result<bool> {
        self.events
            .lock()
            .push((event.clone(), table_name.to_string()));
        Ok(true)
    }
}

/// Handler that reports failure without erroring.
#[derive(Default)]
pub struct RefusingHandler {
    calls: AtomicU64,
}

impl RefusingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeHandler for RefusingHandler {
    async fn handle_change(&self, _: &ChangeEvent, _: &str, _: &[String]) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

/// Handler that errors on every call.
pub struct FailingHandler;

#[async_trait]
impl ChangeHandler for FailingHandler {
    async fn handle_change(&self, event: &ChangeEvent, _: &str, _: &[String]) -> Result<bool> {
        Err(CdcError::handler(
            "failing",
            format!("rejected {}", event.entity_id),
        ))
    }
}

/// Handler that panics on every call.
pub struct PanickingHandler;

#[async_trait]
impl ChangeHandler for PanickingHandler {
    async fn handle_change(&self, _: &ChangeEvent, _: &str, _: &[String]) -> Result<bool> {
        panic!("handler exploded");
    }
}

/// Handler that takes a fixed time per event before recording it.
pub struct SlowHandler {
    delay: Duration,
    inner: RecordingHandler,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            inner: RecordingHandler::default(),
        })
    }

    pub fn count(&self) -> usize {
        self.inner.count()
    }
}

#[async_trait]
impl ChangeHandler for SlowHandler {
    async fn handle_change(
        &self,
        event: &ChangeEvent,
        table_name: &str,
        fields: &[String],
    ) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.handle_change(event, table_name, fields).await
    }
}

/// Pair a handler with the name bindings refer to it by.
pub fn named<H>(name: &str, handler: Arc<H>) -> (&str, Arc<dyn ChangeHandler>)
where
    H: ChangeHandler + 'static,
{
    (name, handler)
}

/// Config tuned for tests: short timeouts, fast supervisor checks.
pub fn test_config() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .shutdown_timeout(Duration::from_secs(1))
        .drain_timeout(WAIT_TIMEOUT)
        .retry_backoff(Duration::from_millis(1))
        .check_interval(Duration::from_millis(20))
}

/// Build a service over `source` with handlers resolved by name.
pub fn build_service(
    config: PipelineConfigBuilder,
    bindings: Vec<BindingConfig>,
    handlers: Vec<(&str, Arc<dyn ChangeHandler>)>,
    source: &Arc<MemoryChangeSource>,
    store: SharedResumeTokenStore,
) -> ChangeDataCaptureService {
    build_service_with_streams(config, bindings, handlers, source.clone(), source, store)
}

/// Like [`build_service`], but change streams come from `streams` while
/// bulk scans still read `source`.
pub fn build_service_with_streams(
    config: PipelineConfigBuilder,
    bindings: Vec<BindingConfig>,
    handlers: Vec<(&str, Arc<dyn ChangeHandler>)>,
    streams: Arc<dyn ChangeSource>,
    source: &Arc<MemoryChangeSource>,
    store: SharedResumeTokenStore,
) -> ChangeDataCaptureService {
    let handlers: HashMap<String, Arc<dyn ChangeHandler>> = handlers
        .into_iter()
        .map(|(name, handler)| (name.to_string(), handler))
        .collect();
    let registry = HandlerRegistry::from_config(&bindings, &handlers).unwrap();
    let mut config = config;
    for binding in bindings {
        config = config.binding(binding);
    }
    ChangeDataCaptureService::new(
        config.build().unwrap(),
        streams,
        source.clone(),
        Arc::new(registry),
        store,
    )
}

/// Change source that refuses to open streams for chosen entity types and
/// delegates everything else to a [`MemoryChangeSource`].
pub struct RefusingSource {
    inner: Arc<MemoryChangeSource>,
    refused: Mutex<HashSet<String>>,
}

impl RefusingSource {
    pub fn new(inner: Arc<MemoryChangeSource>, refused: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner,
            refused: Mutex::new(refused.iter().map(|t| t.to_string()).collect()),
        })
    }

    /// Let streams for `entity_type` open again.
    pub fn allow(&self, entity_type: &str) {
        self.refused.lock().remove(entity_type);
    }
}

#[async_trait]
impl ChangeSource for RefusingSource {
    async fn open_stream(
        &self,
        entity_type: &str,
        resume_after: Option<&ResumeToken>,
    ) -> Result<ChangeStream> {
        if self.refused.lock().contains(entity_type) {
            return Err(CdcError::stream(entity_type, "stream refused"));
        }
        self.inner.open_stream(entity_type, resume_after).await
    }

    async fn current_token(&self, entity_type: &str) -> Result<Option<ResumeToken>> {
        self.inner.current_token(entity_type).await
    }
}
