//! Traits for change sources
//!
//! Database-agnostic boundary to the source database: a change-stream
//! opener for live tailing and a paginated scanner for bulk migration.

use crate::common::{normalize_entity_id, ChangeEvent, ChangeKind, NativeId, ResumeToken, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Operation reported by the source's change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeOperation {
    Insert,
    Update,
    /// Whole-document replacement
    Replace,
    Delete,
}

impl From<NativeOperation> for ChangeKind {
    fn from(op: NativeOperation) -> Self {
        match op {
            NativeOperation::Insert => ChangeKind::Insert,
            NativeOperation::Update | NativeOperation::Replace => ChangeKind::Update,
            NativeOperation::Delete => ChangeKind::Delete,
        }
    }
}

/// A change notification as delivered by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeChange {
    /// Record id in the source's native form
    pub id: NativeId,
    /// Operation kind
    pub operation: NativeOperation,
    /// Full document snapshot (absent for most deletes)
    pub full_document: Option<serde_json::Value>,
    /// Stream position of this change
    pub token: ResumeToken,
}

impl NativeChange {
    /// Convert into a change event for `entity_type`.
    pub fn into_event(self, entity_type: &str) -> ChangeEvent {
        ChangeEvent::new(
            entity_type,
            self.operation.into(),
            normalize_entity_id(&self.id),
            self.full_document,
        )
        .with_resume_token(self.token)
    }
}

/// Stream of native changes for one entity type.
///
/// The stream ending (`None`) or yielding an error means the stream is dead.
pub type ChangeStream = BoxStream<'static, Result<NativeChange>>;

/// Source database change-stream interface.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open a change stream for an entity type.
    ///
    /// With `resume_after`, the stream yields changes strictly after that
    /// position. Without it, the stream starts at "now". An expired or
    /// unknown token must fail with [`CdcError::InvalidResumeToken`].
    ///
    /// [`CdcError::InvalidResumeToken`]: crate::common::CdcError::InvalidResumeToken
    async fn open_stream(
        &self,
        entity_type: &str,
        resume_after: Option<&ResumeToken>,
    ) -> Result<ChangeStream>;

    /// Current head position of the entity type's stream, if the source can
    /// report one. Used as the watermark taken before a bulk scan.
    async fn current_token(&self, entity_type: &str) -> Result<Option<ResumeToken>>;
}

/// A row returned by a full scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub id: NativeId,
    pub document: serde_json::Value,
}

/// One page of a full scan.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    /// Rows in this page
    pub rows: Vec<ScanRow>,
    /// Pagination key of the last row
    pub last_key: Option<String>,
    /// Is this the last page?
    pub is_last: bool,
}

impl ScanBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Full-collection scanner used by bulk migration.
#[async_trait]
pub trait EntityScanner: Send + Sync {
    /// Estimate row count for an entity type.
    async fn estimate_count(&self, entity_type: &str) -> Result<Option<u64>>;

    /// Fetch the page of rows after `after_key`.
    async fn fetch_batch(
        &self,
        entity_type: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<ScanBatch>;
}
