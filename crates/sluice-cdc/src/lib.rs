//! # sluice-cdc - Change Data Capture Pipeline
//!
//! Tails a source database's change stream per entity type, fans every change
//! out to the handlers bound to that type, and persists a resume position per
//! type so streaming continues after a restart with at-least-once delivery.
//! Entity types that have never been synced are bulk migrated first.
//!
//! ## Architecture
//!
//! ```text
//!  stream(users) ──┐                                    ┌─▶ handler A ─▶ sink
//!  stream(orders) ─┼─▶ BoundedQueue ─▶ ChangeDispatcher ┤
//!  stream(tags) ───┘     (shared)       (N workers)     └─▶ handler B ─▶ sink
//!                                            │
//!                                            ▼
//!                                    ResumeTokenStore
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use sluice_cdc::common::{FileResumeTokenStore, HandlerRegistry, MemoryChangeSource};
//! use sluice_cdc::{ChangeDataCaptureService, ChangeHandler, PipelineConfig};
//!
//! let config = PipelineConfig::from_file("sluice.yaml")?;
//! let handlers: HashMap<String, Arc<dyn ChangeHandler>> = HashMap::new();
//! let registry = HandlerRegistry::from_config(&config.bindings, &handlers)?;
//!
//! let source = Arc::new(MemoryChangeSource::new());
//! let store = Arc::new(FileResumeTokenStore::new("/var/lib/sluice/positions").await?);
//!
//! let service = Arc::new(ChangeDataCaptureService::new(
//!     config,
//!     source.clone(),
//!     source,
//!     Arc::new(registry),
//!     store,
//! ));
//! service.start().await?;
//! let _supervisor = service.spawn_supervisor();
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! Events, handler contract, service lifecycle and configuration.
//!
//! ### Tier 2: Pipeline Components (crate root)
//! Tracker, queue, dispatcher, migration and resume stores for hosts that
//! wire the pipeline themselves.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! Statistics snapshots, config sections, source traits and the in-memory
//! source.

pub mod common;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    // Error handling
    CdcError,
    // Events
    ChangeEvent,
    ChangeHandler,
    ChangeKind,
    // Lifecycle
    ChangeDataCaptureService,
    EntitySyncState,
    ErrorCategory,
    HealthReport,
    PipelineConfig,
    Result,
    ResumeToken,
};

// =============================================================================
// TIER 2: Pipeline Components
// =============================================================================

pub use common::{
    BoundedQueue, BulkMigrationHelper, ChangeDispatcher, ChangeQueue, ChangeSource,
    ChangeTracker, EntityScanner, FileResumeTokenStore, HandlerBinding, HandlerRegistry,
    MemoryResumeTokenStore, ResumeTokenStore, Subscription,
};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
//
//   - common::QueueStatsSnapshot, DispatcherStatsSnapshot, MigrationStatsSnapshot
//   - common::QueueConfig, DispatcherConfig, MigrationConfig, SupervisorConfig
//   - common::NativeChange, NativeOperation, NativeId, ScanBatch, ScanRow
//   - common::StreamStatus, InvocationReport, AdvanceOutcome, ResumePosition
//   - common::MemoryChangeSource
//   - common::PipelineMetrics
