//! # Common CDC Types and Traits
//!
//! Source-agnostic building blocks of the change data capture pipeline:
//!
//! - [`ChangeEvent`] - Immutable change envelope
//! - [`ResumeTokenStore`] - Durable per-entity-type stream position
//! - [`ChangeSource`] / [`EntityScanner`] - Source database boundary
//! - [`ChangeTracker`] - Per-entity-type change streams with liveness
//! - [`BoundedQueue`] - Shared fixed-capacity FIFO with blocking enqueue
//! - [`ChangeDispatcher`] - Worker pool routing events to handlers
//! - [`HandlerRegistry`] - Static entity type to handler bindings
//! - [`BulkMigrationHelper`] - One-time full scan for unsynced types
//! - [`ChangeDataCaptureService`] - Lifecycle, health and supervision
//! - [`PipelineConfig`] - YAML configuration
//! - [`PipelineMetrics`] - `metrics` crate facade
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  first run  ┌───────────────────┐
//! │ EntityScanner│────────────▶│ BulkMigrationHelper│──┐
//! └──────────────┘             └───────────────────┘  │
//!                                                     ▼
//! ┌──────────────┐  ┌───────────────┐  ┌──────────────────┐  ┌─────────────────┐
//! │ ChangeSource │─▶│ ChangeTracker │─▶│   BoundedQueue   │─▶│ ChangeDispatcher│
//! └──────────────┘  └───────────────┘  └──────────────────┘  └────────┬────────┘
//!                                                                    │
//!                              ┌─────────────────┐    ┌──────────────▼───┐
//!                              │ResumeTokenStore │◀───│ HandlerRegistry  │
//!                              └─────────────────┘    └──────────────────┘
//! ```

mod checkpoint;
mod config;
mod dispatcher;
mod error;
mod event;
mod memory;
mod metrics;
mod migration;
mod queue;
mod registry;
mod service;
mod source;
mod tracker;

pub use checkpoint::*;
pub use config::*;
pub use dispatcher::*;
pub use error::*;
pub use event::*;
pub use memory::*;
pub use metrics::*;
pub use migration::*;
pub use queue::*;
pub use registry::*;
pub use service::*;
pub use source::*;
pub use tracker::*;
