//! # Bulk Migration
//!
//! One-time catch-up for entity types that have never been synced. Every
//! existing row is read with a paginated full scan, turned into a synthesized
//! INSERT event (no resume token) and pushed through
//! [`HandlerRegistry::invoke`], the same path the dispatcher uses. The shared
//! queue is not involved.
//!
//! Migration never writes a resume position; a type only gets one once its
//! first streamed event is handled.
//!
//! ## Usage
//!
//! ```ignore
//! let helper = BulkMigrationHelper::new(scanner, registry, store, MigrationConfig::default());
//!
//! if helper.needs_migration("users").await? {
//!     let report = helper.migrate_entity("users").await?;
//!     println!("{} rows in {:?}", report.rows, report.duration);
//! }
//! ```

use crate::common::{
    normalize_entity_id, CdcError, ChangeEvent, EntityScanner, HandlerRegistry, MigrationConfig,
    PipelineMetrics, Result, ScanBatch, SharedResumeTokenStore,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Drives full-scan migration of unsynced entity types through the handlers.
pub struct BulkMigrationHelper {
    scanner: Arc<dyn EntityScanner>,
    registry: Arc<HandlerRegistry>,
    store: SharedResumeTokenStore,
    config: MigrationConfig,
    stats: MigrationStats,
    cancelled: AtomicBool,
}

/// Result of migrating one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub entity_type: String,
    /// Rows read and delivered as INSERT events
    pub rows: u64,
    /// Pages fetched
    pub batches: u64,
    /// Failed binding invocations
    pub handler_failures: u64,
    /// Row estimate reported before the scan
    pub estimated_rows: Option<u64>,
    pub duration: Duration,
}

impl BulkMigrationHelper {
    pub fn new(
        scanner: Arc<dyn EntityScanner>,
        registry: Arc<HandlerRegistry>,
        store: SharedResumeTokenStore,
        config: MigrationConfig,
    ) -> Self {
        Self {
            scanner,
            registry,
            store,
            config,
            stats: MigrationStats::default(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// An entity type needs migration when it has no stored resume position.
    pub async fn needs_migration(&self, entity_type: &str) -> Result<bool> {
        Ok(self.store.get(entity_type).await?.is_none())
    }

    /// Scan every row of `entity_type` and deliver it to the bound handlers.
    pub async fn migrate_entity(&self, entity_type: &str) -> Result<MigrationReport> {
        match self.scan_entity(entity_type).await {
            Ok(report) => {
                self.stats.entities_completed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Bulk migration of {} complete: {} rows in {} batches ({} handler failures) in {:?}",
                    report.entity_type,
                    report.rows,
                    report.batches,
                    report.handler_failures,
                    report.duration
                );
                Ok(report)
            }
            Err(e) => {
                self.stats.entities_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Bulk migration of {} failed: {}", entity_type, e);
                Err(e)
            }
        }
    }

    async fn scan_entity(&self, entity_type: &str) -> Result<MigrationReport> {
        let start = Instant::now();
        let estimated_rows = match self.scanner.estimate_count(entity_type).await {
            Ok(count) => count,
            Err(e) => {
                debug!("Row estimate for {} unavailable: {}", entity_type, e);
                None
            }
        };
        info!(
            "Bulk migrating {} (estimated rows: {})",
            entity_type,
            estimated_rows.map_or_else(|| "unknown".to_string(), |n| n.to_string())
        );

        let mut report = MigrationReport {
            entity_type: entity_type.to_string(),
            rows: 0,
            batches: 0,
            handler_failures: 0,
            estimated_rows,
            duration: Duration::ZERO,
        };
        let mut last_key: Option<String> = None;

        loop {
            if self.is_cancelled() {
                return Err(CdcError::shutdown(format!(
                    "bulk migration of {} cancelled",
                    entity_type
                )));
            }

            let batch = self.fetch_with_retry(entity_type, last_key.as_deref()).await?;
            let is_last = batch.is_last || batch.is_empty();

            if !batch.is_empty() {
                if batch.last_key.is_none() && !is_last {
                    return Err(CdcError::other(format!(
                        "scanner returned a page for {} without a continuation key",
                        entity_type
                    )));
                }
                let rows = batch.len() as u64;
                last_key = batch.last_key.clone();

                for row in batch.rows {
                    let entity_id = normalize_entity_id(&row.id);
                    let event = ChangeEvent::insert(entity_type, entity_id, row.document);
                    let outcome = self.registry.invoke(&event).await;
                    report.handler_failures += outcome.failures.len() as u64;
                }

                report.rows += rows;
                report.batches += 1;
                self.stats.rows.fetch_add(rows, Ordering::Relaxed);
                self.stats.batches.fetch_add(1, Ordering::Relaxed);
                PipelineMetrics::record_rows_migrated(entity_type, rows);
                debug!("Migrated {} rows of {} so far", report.rows, entity_type);
            }

            if is_last {
                break;
            }
        }

        report.duration = start.elapsed();
        Ok(report)
    }

    async fn fetch_with_retry(
        &self,
        entity_type: &str,
        last_key: Option<&str>,
    ) -> Result<ScanBatch> {
        let mut attempts = 0;
        loop {
            match self
                .scanner
                .fetch_batch(entity_type, last_key, self.config.batch_size)
                .await
            {
                Ok(batch) => return Ok(batch),
                Err(e) => {
                    attempts += 1;
                    if !e.is_retriable() || attempts >= self.config.max_retries {
                        return Err(e);
                    }
                    let delay = self.config.retry_delay(attempts);
                    warn!(
                        "Scan of {} failed (attempt {}), retrying in {:?}: {}",
                        entity_type, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Migrate every listed entity type that has no stored resume position.
    ///
    /// Stops at the first failure.
    pub async fn migrate_all(&self, entity_types: &[String]) -> Result<Vec<MigrationReport>> {
        let mut reports = Vec::new();
        for entity_type in entity_types {
            if !self.needs_migration(entity_type).await? {
                debug!("{} already has a resume position, skipping migration", entity_type);
                continue;
            }
            reports.push(self.migrate_entity(entity_type).await?);
        }
        Ok(reports)
    }

    /// Cancel running and future migrations.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Get statistics.
    pub fn stats(&self) -> MigrationStatsSnapshot {
        self.stats.snapshot()
    }
}

#[derive(Debug, Default)]
struct MigrationStats {
    rows: AtomicU64,
    batches: AtomicU64,
    entities_completed: AtomicU64,
    entities_failed: AtomicU64,
}

impl MigrationStats {
    fn snapshot(&self) -> MigrationStatsSnapshot {
        MigrationStatsSnapshot {
            rows_migrated: self.rows.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            entities_completed: self.entities_completed.load(Ordering::Relaxed),
            entities_failed: self.entities_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of migration statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatsSnapshot {
    pub rows_migrated: u64,
    pub batches: u64,
    pub entities_completed: u64,
    pub entities_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{
        ChangeHandler, ChangeKind, HandlerBinding, MemoryChangeSource, MemoryResumeTokenStore,
        NativeId, ResumePosition, ResumeToken, ResumeTokenStore,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeHandler for Recording {
        async fn handle_change(&self, event: &ChangeEvent, _: &str, _: &[String]) -> Result<bool> {
            self.events.lock().push(event.clone());
            Ok(true)
        }
    }

    struct Setup {
        source: Arc<MemoryChangeSource>,
        store: Arc<MemoryResumeTokenStore>,
        handler: Arc<Recording>,
        helper: BulkMigrationHelper,
    }

    fn setup(batch_size: usize) -> Setup {
        let source = Arc::new(MemoryChangeSource::new());
        let store = Arc::new(MemoryResumeTokenStore::new());
        let handler = Arc::new(Recording::default());
        let registry = HandlerRegistry::builder()
            .bind(HandlerBinding::new("tags", "rec", "tags", handler.clone()))
            .build()
            .unwrap();
        let config = MigrationConfig {
            batch_size,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let helper =
            BulkMigrationHelper::new(source.clone(), Arc::new(registry), store.clone(), config);
        Setup {
            source,
            store,
            handler,
            helper,
        }
    }

    #[tokio::test]
    async fn test_every_row_delivered_once_as_insert() {
        let s = setup(2);
        s.source
            .seed_rows("tags", (1..=5).map(|i| (NativeId::Int(i), json!({"id": i}))));

        assert!(s.helper.needs_migration("tags").await.unwrap());
        let report = s.helper.migrate_entity("tags").await.unwrap();

        assert_eq!(report.rows, 5);
        assert_eq!(report.batches, 3);
        assert_eq!(report.estimated_rows, Some(5));

        let events = s.handler.events.lock().clone();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.change_kind == ChangeKind::Insert));
        assert!(events.iter().all(|e| e.is_synthesized()));

        let mut ids: Vec<_> = events.iter().map(|e| e.entity_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);

        assert!(s.store.get("tags").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_structured_ids_are_normalized() {
        let s = setup(10);
        s.source
            .seed_rows("tags", [(NativeId::ObjectId([0x0f; 12]), json!({"n": 1}))]);

        s.helper.migrate_entity("tags").await.unwrap();
        assert_eq!(
            s.handler.events.lock()[0].entity_id,
            "0f0f0f0f0f0f0f0f0f0f0f0f"
        );
    }

    #[tokio::test]
    async fn test_transient_scan_failures_are_retried() {
        let s = setup(10);
        s.source.seed_rows("tags", [(NativeId::Int(1), json!({}))]);
        s.source.fail_next_scans(2);

        let report = s.helper.migrate_entity("tags").await.unwrap();
        assert_eq!(report.rows, 1);
        assert_eq!(s.source.scan_count(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let s = setup(10);
        s.source.fail_next_scans(10);

        assert!(s.helper.migrate_entity("tags").await.is_err());
        assert_eq!(s.helper.stats().entities_failed, 1);
        assert!(s.handler.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_all_skips_synced_types() {
        let s = setup(10);
        s.source.seed_rows("tags", [(NativeId::Int(1), json!({}))]);
        s.store.insert(ResumePosition::new("tags", ResumeToken::from_sequence(1)));

        assert!(!s.helper.needs_migration("tags").await.unwrap());
        let reports = s.helper.migrate_all(&["tags".to_string()]).await.unwrap();
        assert!(reports.is_empty());
        assert!(s.handler.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_entity_type() {
        let s = setup(10);
        let report = s.helper.migrate_entity("tags").await.unwrap();
        assert_eq!(report.rows, 0);
        assert_eq!(s.helper.stats().entities_completed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_migration() {
        let s = setup(10);
        s.helper.cancel();
        let err = s.helper.migrate_entity("tags").await.unwrap_err();
        assert!(matches!(err, CdcError::Shutdown(_)));
    }
}
