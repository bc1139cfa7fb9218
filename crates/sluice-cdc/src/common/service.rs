//! # Change Data Capture Service
//!
//! Lifecycle owner for the whole pipeline: bulk migration, change tracker,
//! shared queue and dispatcher.
//!
//! ## Startup
//!
//! ```text
//! for each bound entity type:
//!   HAS_TOKEN  ───────────────────────────────▶ STREAMING (resume after token)
//!   NO_TOKEN ─▶ BULK_MIGRATING ─▶ scan done ──▶ STREAMING (from pre-scan watermark)
//! then drain the live queue ─▶ ready
//! ```
//!
//! The dispatcher starts first so already-synced types keep flowing while
//! unsynced types are migrated. Before scanning, the source's current
//! position is captured; the type's stream is then opened after that
//! watermark so changes made during the scan are delivered again instead of
//! lost. Migration writes no resume position.
//!
//! ## Liveness
//!
//! [`is_live`](ChangeDataCaptureService::is_live) is "any stream alive and
//! dispatcher alive". A stream that dies shows as
//! [`EntitySyncState::StreamDead`]; [`spawn_supervisor`] restarts tracker
//! and dispatcher together from stored tokens and never re-runs migration
//! for a type that has a token or was migrated by this process.
//!
//! [`spawn_supervisor`]: ChangeDataCaptureService::spawn_supervisor

use crate::common::{
    BulkMigrationHelper, CdcError, ChangeDispatcher, ChangeQueue, ChangeSource, ChangeTracker,
    DispatcherStatsSnapshot, EntityScanner, HandlerRegistry, PipelineConfig, QueueStatsSnapshot,
    ResumeToken, Result, SharedResumeTokenStore, StreamStatus, Subscription,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-entity-type synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitySyncState {
    /// No resume position; bulk migration pending
    NoToken,
    /// Resume position found; stream not yet open
    HasToken,
    BulkMigrating,
    Streaming,
    /// Stream died and has not been restarted
    StreamDead,
}

impl std::fmt::Display for EntitySyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitySyncState::NoToken => write!(f, "NO_TOKEN"),
            EntitySyncState::HasToken => write!(f, "HAS_TOKEN"),
            EntitySyncState::BulkMigrating => write!(f, "BULK_MIGRATING"),
            EntitySyncState::Streaming => write!(f, "STREAMING"),
            EntitySyncState::StreamDead => write!(f, "STREAM_DEAD"),
        }
    }
}

/// Point-in-time health of the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Any stream alive and dispatcher alive
    pub live: bool,
    /// Startup (migration and drain) finished
    pub ready: bool,
    /// Some stream is dead while the pipeline is running
    pub degraded: bool,
    pub streams: Vec<StreamStatus>,
    pub dispatcher: Option<DispatcherStatsSnapshot>,
    pub queue: Option<QueueStatsSnapshot>,
    pub entities: BTreeMap<String, EntitySyncState>,
}

struct Runtime {
    queue: Arc<ChangeQueue>,
    tracker: ChangeTracker,
    dispatcher: ChangeDispatcher,
    migration: BulkMigrationHelper,
    /// Fired by `stop` to abandon a startup still in progress
    cancel: CancellationToken,
}

/// Runs bulk migration and live streaming for every bound entity type.
pub struct ChangeDataCaptureService {
    config: PipelineConfig,
    source: Arc<dyn ChangeSource>,
    scanner: Arc<dyn EntityScanner>,
    registry: Arc<HandlerRegistry>,
    store: SharedResumeTokenStore,
    runtime: Mutex<Option<Arc<Runtime>>>,
    lifecycle: tokio::sync::Mutex<()>,
    states: Mutex<HashMap<String, EntitySyncState>>,
    /// Types migrated by this process, with the position captured before the scan
    watermarks: Mutex<HashMap<String, Option<ResumeToken>>>,
    wanted: AtomicBool,
    ready: AtomicBool,
    supervisor: Mutex<Option<CancellationToken>>,
}

impl ChangeDataCaptureService {
    /// Create a service for the entity types bound in `registry`.
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn ChangeSource>,
        scanner: Arc<dyn EntityScanner>,
        registry: Arc<HandlerRegistry>,
        store: SharedResumeTokenStore,
    ) -> Self {
        Self {
            config,
            source,
            scanner,
            registry,
            store,
            runtime: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            states: Mutex::new(HashMap::new()),
            watermarks: Mutex::new(HashMap::new()),
            wanted: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    /// Entity types the service streams.
    pub fn entity_types(&self) -> Vec<String> {
        self.registry.entity_types()
    }

    /// Migrate unsynced types, start streaming, and wait for the live queue
    /// to drain.
    ///
    /// Fails on setup errors (no stream could be opened at all, migration
    /// failed, drain timed out, stopped mid-startup); the partially started
    /// pipeline is torn down first. A type whose stream fails to open while
    /// others stream is reported as [`EntitySyncState::StreamDead`] and left
    /// to the supervisor.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    /// Stop the tracker, then shut down the dispatcher, and end the
    /// supervisor loop. A `start` still migrating or draining is abandoned
    /// and returns [`CdcError::Shutdown`].
    pub async fn stop(&self) {
        self.wanted.store(false, Ordering::SeqCst);
        if let Some(cancel) = self.supervisor.lock().take() {
            cancel.cancel();
        }
        if let Some(runtime) = self.runtime.lock().as_ref() {
            runtime.cancel.cancel();
            runtime.migration.cancel();
        }

        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// Stop and start tracker and dispatcher together.
    ///
    /// Types with a stored token resume from it; types migrated earlier by
    /// this process resume from their watermark. Only types never synced
    /// are migrated.
    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        info!("Restarting change data capture pipeline");
        self.teardown().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<()> {
        if self.runtime.lock().is_some() {
            return Err(CdcError::invalid_state("pipeline already started"));
        }
        self.ready.store(false, Ordering::SeqCst);
        self.states.lock().clear();

        let entity_types = self.entity_types();
        if entity_types.is_empty() {
            warn!("No handler bindings registered; nothing will be streamed");
        }

        let runtime = Arc::new(self.build_runtime());
        let workers = self
            .config
            .dispatcher
            .workers
            .unwrap_or(entity_types.len())
            .max(1);
        runtime.dispatcher.start(workers)?;
        *self.runtime.lock() = Some(runtime.clone());

        match self.bring_up(&runtime, &entity_types).await {
            Ok(()) => {
                self.wanted.store(true, Ordering::SeqCst);
                self.ready.store(true, Ordering::SeqCst);
                info!(
                    "Change data capture pipeline ready ({} entity types, {} workers)",
                    entity_types.len(),
                    workers
                );
                Ok(())
            }
            Err(e) => {
                error!("Pipeline startup failed: {}", e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    fn build_runtime(&self) -> Runtime {
        let queue = Arc::new(ChangeQueue::new(self.config.queue.capacity));
        let tracker = ChangeTracker::new(self.source.clone(), queue.clone())
            .with_shutdown_timeout(self.config.dispatcher.shutdown_timeout());
        let dispatcher = ChangeDispatcher::new(
            queue.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.config.dispatcher.clone(),
        );
        let migration = BulkMigrationHelper::new(
            self.scanner.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.config.migration.clone(),
        );
        Runtime {
            queue,
            tracker,
            dispatcher,
            migration,
            cancel: CancellationToken::new(),
        }
    }

    async fn bring_up(&self, runtime: &Runtime, entity_types: &[String]) -> Result<()> {
        let mut resumable = Vec::new();
        let mut unsynced = Vec::new();

        for entity_type in entity_types {
            if let Some(position) = self.store.get(entity_type).await? {
                debug!(
                    "{} resumes after {}",
                    entity_type, position.last_synced_token
                );
                self.set_state(entity_type, EntitySyncState::HasToken);
                resumable.push(
                    Subscription::new(entity_type).resume_after(position.last_synced_token),
                );
                continue;
            }

            let watermark = self.watermarks.lock().get(entity_type).cloned();
            match watermark {
                Some(watermark) => {
                    debug!("{} was migrated earlier; resuming from its watermark", entity_type);
                    self.set_state(entity_type, EntitySyncState::HasToken);
                    resumable.push(subscription_from(entity_type, watermark));
                }
                None => {
                    self.set_state(entity_type, EntitySyncState::NoToken);
                    unsynced.push(entity_type.clone());
                }
            }
        }

        self.open_streams(runtime, resumable).await?;

        for entity_type in &unsynced {
            let subscription = if self.config.migration.enabled {
                self.migrate(runtime, entity_type).await?
            } else {
                warn!(
                    "Bulk migration disabled; {} streams from now without historical rows",
                    entity_type
                );
                Subscription::new(entity_type)
            };
            self.open_streams(runtime, vec![subscription]).await?;
        }

        if !entity_types.is_empty() && !runtime.tracker.is_any_stream_alive() {
            return Err(CdcError::stream(
                entity_types.join(","),
                "no change stream could be opened",
            ));
        }

        if !unsynced.is_empty() {
            info!("Bulk migration finished; draining live queue");
            let drain_timeout = self.config.migration.drain_timeout();
            tokio::select! {
                drained = runtime.dispatcher.drain(drain_timeout) => drained?,
                _ = runtime.cancel.cancelled() => {
                    return Err(CdcError::shutdown("pipeline stopped during startup"));
                }
            }
        }

        Ok(())
    }

    /// Open streams for `subscriptions`. A type whose stream cannot be opened
    /// is kept and reported as [`EntitySyncState::StreamDead`]; startup only
    /// fails later if no stream at all is alive.
    async fn open_streams(
        &self,
        runtime: &Runtime,
        subscriptions: Vec<Subscription>,
    ) -> Result<()> {
        if subscriptions.is_empty() {
            return Ok(());
        }
        let types: Vec<String> = subscriptions
            .iter()
            .map(|s| s.entity_type.clone())
            .collect();
        match runtime.tracker.start(subscriptions).await {
            Ok(()) => {}
            Err(CdcError::Stream { message, .. }) => {
                warn!("No stream opened for {:?}: {}", types, message);
            }
            Err(e) => return Err(e),
        }
        for entity_type in &types {
            self.set_state(entity_type, EntitySyncState::Streaming);
        }
        Ok(())
    }

    async fn migrate(&self, runtime: &Runtime, entity_type: &str) -> Result<Subscription> {
        self.set_state(entity_type, EntitySyncState::BulkMigrating);
        let watermark = self.source.current_token(entity_type).await?;
        runtime.migration.migrate_entity(entity_type).await?;
        self.watermarks
            .lock()
            .insert(entity_type.to_string(), watermark.clone());
        Ok(subscription_from(entity_type, watermark))
    }

    async fn teardown(&self) {
        self.ready.store(false, Ordering::SeqCst);
        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.cancel.cancel();
            runtime.migration.cancel();
            runtime.tracker.stop().await;
            runtime.dispatcher.shutdown().await;
            info!(
                "Change data capture pipeline stopped ({} events completed)",
                runtime.dispatcher.completed_count()
            );
        }
        self.states.lock().clear();
    }

    fn set_state(&self, entity_type: &str, state: EntitySyncState) {
        debug!("{} -> {}", entity_type, state);
        self.states.lock().insert(entity_type.to_string(), state);
    }

    fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.lock().clone()
    }

    /// Liveness probe: some stream alive and the dispatcher alive.
    pub fn is_live(&self) -> bool {
        self.runtime().is_some_and(|rt| {
            rt.tracker.is_any_stream_alive() && rt.dispatcher.is_alive()
        })
    }

    /// Readiness: startup migration and drain have completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// State of one entity type; `None` when the pipeline is not running.
    pub fn entity_state(&self, entity_type: &str) -> Option<EntitySyncState> {
        let state = self.states.lock().get(entity_type).copied()?;
        if state != EntitySyncState::Streaming {
            return Some(state);
        }
        match self.runtime() {
            Some(rt) if !rt.tracker.is_streaming(entity_type) => Some(EntitySyncState::StreamDead),
            _ => Some(state),
        }
    }

    pub fn health(&self) -> HealthReport {
        let runtime = self.runtime();
        let entities: BTreeMap<String, EntitySyncState> = self
            .entity_types()
            .into_iter()
            .filter_map(|t| self.entity_state(&t).map(|s| (t, s)))
            .collect();
        let degraded = entities.values().any(|s| *s == EntitySyncState::StreamDead);

        HealthReport {
            live: self.is_live(),
            ready: self.is_ready(),
            degraded,
            streams: runtime
                .as_ref()
                .map(|rt| rt.tracker.stream_status())
                .unwrap_or_default(),
            dispatcher: runtime.as_ref().map(|rt| rt.dispatcher.stats()),
            queue: runtime.as_ref().map(|rt| rt.queue.stats()),
            entities,
        }
    }

    /// Poll health every `supervisor.check_interval_ms` and, when
    /// `auto_restart` is set, restart a pipeline that is not live or has a
    /// dead stream. Ends on [`stop`](Self::stop).
    pub fn spawn_supervisor(self: &Arc<Self>) -> JoinHandle<()> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.supervisor.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let service = Arc::clone(self);
        let interval = self.config.supervisor.check_interval();
        let auto_restart = self.config.supervisor.auto_restart;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !service.wanted.load(Ordering::SeqCst) {
                    continue;
                }
                let health = service.health();
                if health.live && !health.degraded {
                    continue;
                }

                warn!(
                    "Pipeline unhealthy (live: {}, dead streams: {:?})",
                    health.live,
                    health
                        .entities
                        .iter()
                        .filter(|(_, s)| **s == EntitySyncState::StreamDead)
                        .map(|(t, _)| t.as_str())
                        .collect::<Vec<_>>()
                );
                if !auto_restart {
                    continue;
                }

                match service.restart().await {
                    Ok(()) => info!("Pipeline restarted by supervisor"),
                    Err(e) => error!("Supervisor restart failed, retrying next check: {}", e),
                }
            }
            debug!("Supervisor stopped");
        })
    }
}

fn subscription_from(entity_type: &str, watermark: Option<ResumeToken>) -> Subscription {
    match watermark {
        Some(token) => Subscription::new(entity_type).resume_after(token),
        None => Subscription::new(entity_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        ChangeEvent, ChangeHandler, HandlerBinding, MemoryChangeSource, MemoryResumeTokenStore,
        NativeId, ResumePosition, ResumeTokenStore,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Counting {
        events: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeHandler for Counting {
        async fn handle_change(&self, event: &ChangeEvent, _: &str, _: &[String]) -> Result<bool> {
            self.events.lock().push(event.clone());
            Ok(true)
        }
    }

    fn service(
        source: &Arc<MemoryChangeSource>,
        store: &Arc<MemoryResumeTokenStore>,
        handler: &Arc<Counting>,
    ) -> ChangeDataCaptureService {
        let registry = HandlerRegistry::builder()
            .bind(HandlerBinding::new("users", "count", "users", handler.clone()))
            .bind(HandlerBinding::new("orders", "count", "orders", handler.clone()))
            .build()
            .unwrap();
        let config = PipelineConfig::builder()
            .shutdown_timeout(Duration::from_secs(1))
            .drain_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        ChangeDataCaptureService::new(
            config,
            source.clone(),
            source.clone(),
            Arc::new(registry),
            store.clone(),
        )
    }

    #[tokio::test]
    async fn test_start_migrates_then_streams() {
        let source = Arc::new(MemoryChangeSource::new());
        let store = Arc::new(MemoryResumeTokenStore::new());
        let handler = Arc::new(Counting::default());
        source.seed_rows("users", [(NativeId::Int(1), json!({"id": 1}))]);
        store.insert(ResumePosition::new("orders", ResumeToken::from_sequence(0)));

        let svc = service(&source, &store, &handler);
        svc.start().await.unwrap();

        assert!(svc.is_live());
        assert!(svc.is_ready());
        assert_eq!(svc.entity_state("users"), Some(EntitySyncState::Streaming));
        assert_eq!(svc.entity_state("orders"), Some(EntitySyncState::Streaming));
        assert_eq!(handler.events.lock().len(), 1);
        assert!(store.get("users").await.unwrap().is_none());

        svc.stop().await;
        assert!(!svc.is_live());
        assert_eq!(source.active_streams(), 0);
        assert_eq!(svc.entity_state("users"), None);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let source = Arc::new(MemoryChangeSource::new());
        let store = Arc::new(MemoryResumeTokenStore::new());
        let handler = Arc::new(Counting::default());
        let svc = service(&source, &store, &handler);

        svc.start().await.unwrap();
        assert!(matches!(svc.start().await, Err(CdcError::InvalidState(_))));
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_start_fails_when_source_down() {
        let source = Arc::new(MemoryChangeSource::new());
        let store = Arc::new(MemoryResumeTokenStore::new());
        let handler = Arc::new(Counting::default());
        store.insert(ResumePosition::new("users", ResumeToken::from_sequence(0)));
        store.insert(ResumePosition::new("orders", ResumeToken::from_sequence(0)));
        source.set_unavailable(true);

        let svc = service(&source, &store, &handler);
        assert!(svc.start().await.is_err());
        assert!(!svc.is_live());
        assert!(svc.health().dispatcher.is_none());
    }

    #[tokio::test]
    async fn test_dead_stream_reported() {
        let source = Arc::new(MemoryChangeSource::new());
        let store = Arc::new(MemoryResumeTokenStore::new());
        let handler = Arc::new(Counting::default());
        let svc = service(&source, &store, &handler);
        svc.start().await.unwrap();

        source.fail_streams("users");
        for _ in 0..200 {
            if svc.entity_state("users") == Some(EntitySyncState::StreamDead) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let health = svc.health();
        assert_eq!(health.entities["users"], EntitySyncState::StreamDead);
        assert!(health.degraded);
        assert!(health.live);
        svc.stop().await;
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EntitySyncState::BulkMigrating.to_string(), "BULK_MIGRATING");
        assert_eq!(
            serde_json::to_value(EntitySyncState::StreamDead).unwrap(),
            "STREAM_DEAD"
        );
    }
}
