//! In-memory change source
//!
//! A [`ChangeSource`] + [`EntityScanner`] backed by per-entity-type change
//! logs held in memory. Used by tests and local experiments to drive the
//! whole pipeline without a database.
//!
//! Positions are sequence numbers encoded with [`ResumeToken::from_sequence`];
//! the n-th change of a type carries sequence `n`. Resuming after sequence
//! `s` yields changes `s + 1..`.
//!
//! ```ignore
//! let source = Arc::new(MemoryChangeSource::new());
//! source.seed_rows("users", [(NativeId::Int(1), json!({"id": 1}))]);
//! let token = source.insert("users", NativeId::Int(2), json!({"id": 2}));
//! ```

use crate::common::{
    normalize_entity_id, CdcError, ChangeSource, ChangeStream, EntityScanner, NativeChange,
    NativeId, NativeOperation, ResumeToken, Result, ScanBatch, ScanRow,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// In-memory change source and scanner.
#[derive(Default)]
pub struct MemoryChangeSource {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    entities: Mutex<HashMap<String, EntityLog>>,
    active_streams: AtomicUsize,
    opens: Mutex<Vec<(String, Option<ResumeToken>)>>,
    scan_failures: AtomicU32,
    scans: AtomicU64,
    unavailable: AtomicBool,
}

struct EntityLog {
    changes: Vec<NativeChange>,
    rows: BTreeMap<String, ScanRow>,
    /// Resume positions below this sequence are no longer retained
    expired_below: u64,
    head: watch::Sender<LogHead>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct LogHead {
    len: u64,
    kill_epoch: u64,
}

impl EntityLog {
    fn new() -> Self {
        let (head, _) = watch::channel(LogHead::default());
        Self {
            changes: Vec::new(),
            rows: BTreeMap::new(),
            expired_below: 0,
            head,
        }
    }

    fn len(&self) -> u64 {
        self.changes.len() as u64
    }
}

impl Inner {
    fn with_log<R>(&self, entity_type: &str, f: impl FnOnce(&mut EntityLog) -> R) -> R {
        let mut entities = self.entities.lock();
        let log = entities
            .entry(entity_type.to_string())
            .or_insert_with(EntityLog::new);
        f(log)
    }

    fn change_at(&self, entity_type: &str, index: u64) -> Option<NativeChange> {
        let entities = self.entities.lock();
        entities
            .get(entity_type)
            .and_then(|log| log.changes.get(index as usize).cloned())
    }
}

impl MemoryChangeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change to an entity type's log and apply it to the row set.
    ///
    /// Returns the token of the new change.
    pub fn push_change(
        &self,
        entity_type: &str,
        id: NativeId,
        operation: NativeOperation,
        document: Option<serde_json::Value>,
    ) -> ResumeToken {
        self.inner.with_log(entity_type, |log| {
            let key = normalize_entity_id(&id);
            match (operation, &document) {
                (NativeOperation::Delete, _) => {
                    log.rows.remove(&key);
                }
                (_, Some(doc)) => {
                    log.rows.insert(
                        key,
                        ScanRow {
                            id: id.clone(),
                            document: doc.clone(),
                        },
                    );
                }
                (_, None) => {}
            }

            let token = ResumeToken::from_sequence(log.len() + 1);
            log.changes.push(NativeChange {
                id,
                operation,
                full_document: document,
                token: token.clone(),
            });
            let len = log.len();
            log.head.send_modify(|head| head.len = len);
            token
        })
    }

    pub fn insert(
        &self,
        entity_type: &str,
        id: NativeId,
        document: serde_json::Value,
    ) -> ResumeToken {
        self.push_change(entity_type, id, NativeOperation::Insert, Some(document))
    }

    pub fn update(
        &self,
        entity_type: &str,
        id: NativeId,
        document: serde_json::Value,
    ) -> ResumeToken {
        self.push_change(entity_type, id, NativeOperation::Update, Some(document))
    }

    pub fn delete(&self, entity_type: &str, id: NativeId) -> ResumeToken {
        self.push_change(entity_type, id, NativeOperation::Delete, None)
    }

    /// Add pre-existing rows that have no change history.
    pub fn seed_rows(
        &self,
        entity_type: &str,
        rows: impl IntoIterator<Item = (NativeId, serde_json::Value)>,
    ) {
        self.inner.with_log(entity_type, |log| {
            for (id, document) in rows {
                log.rows
                    .insert(normalize_entity_id(&id), ScanRow { id, document });
            }
        });
    }

    /// Stop retaining history below `sequence`; older resume tokens become invalid.
    pub fn expire_tokens_before(&self, entity_type: &str, sequence: u64) {
        self.inner
            .with_log(entity_type, |log| log.expired_below = sequence);
    }

    /// Kill every open stream of an entity type (simulated disconnect).
    pub fn fail_streams(&self, entity_type: &str) {
        self.inner.with_log(entity_type, |log| {
            log.head.send_modify(|head| head.kill_epoch += 1);
        });
    }

    /// Make the next `count` scan page fetches fail with a transient error.
    pub fn fail_next_scans(&self, count: u32) {
        self.inner.scan_failures.store(count, Ordering::SeqCst);
    }

    /// Make every `open_stream` call fail (source unreachable).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of streams currently open (not yet dropped).
    pub fn active_streams(&self) -> usize {
        self.inner.active_streams.load(Ordering::SeqCst)
    }

    /// Total number of successful `open_stream` calls.
    pub fn open_count(&self) -> usize {
        self.inner.opens.lock().len()
    }

    /// Every successful open as `(entity_type, resume_after)`, in call order.
    pub fn open_history(&self) -> Vec<(String, Option<ResumeToken>)> {
        self.inner.opens.lock().clone()
    }

    /// Number of scan page fetches attempted.
    pub fn scan_count(&self) -> u64 {
        self.inner.scans.load(Ordering::SeqCst)
    }

    /// Rows currently present for an entity type.
    pub fn row_count(&self, entity_type: &str) -> usize {
        self.inner.with_log(entity_type, |log| log.rows.len())
    }
}

struct StreamGuard(Arc<Inner>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

struct StreamState {
    inner: Arc<Inner>,
    entity_type: String,
    next: u64,
    epoch: u64,
    rx: watch::Receiver<LogHead>,
    done: bool,
    _guard: StreamGuard,
}

fn change_stream(state: StreamState) -> ChangeStream {
    futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            let head = *st.rx.borrow_and_update();
            if head.kill_epoch != st.epoch {
                st.done = true;
                let err = CdcError::stream(&st.entity_type, "connection lost");
                return Some((Err(err), st));
            }
            if st.next < head.len {
                let change = st.inner.change_at(&st.entity_type, st.next);
                st.next += 1;
                if let Some(change) = change {
                    return Some((Ok(change), st));
                }
                continue;
            }
            if st.rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .boxed()
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn open_stream(
        &self,
        entity_type: &str,
        resume_after: Option<&ResumeToken>,
    ) -> Result<ChangeStream> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(CdcError::stream(entity_type, "source unavailable"));
        }

        let (next, epoch, rx) = self.inner.with_log(entity_type, |log| {
            let next = match resume_after {
                None => log.len(),
                Some(token) => match token.to_sequence() {
                    Some(seq) if seq >= log.expired_below && seq <= log.len() => seq,
                    _ => {
                        return Err(CdcError::invalid_resume_token(
                            entity_type,
                            token.as_str(),
                        ))
                    }
                },
            };
            let rx = log.head.subscribe();
            let epoch = rx.borrow().kill_epoch;
            Ok((next, epoch, rx))
        })?;

        self.inner
            .opens
            .lock()
            .push((entity_type.to_string(), resume_after.cloned()));
        self.inner.active_streams.fetch_add(1, Ordering::SeqCst);
        debug!("Opened memory stream for {} at sequence {}", entity_type, next);

        Ok(change_stream(StreamState {
            inner: self.inner.clone(),
            entity_type: entity_type.to_string(),
            next,
            epoch,
            rx,
            done: false,
            _guard: StreamGuard(self.inner.clone()),
        }))
    }

    async fn current_token(&self, entity_type: &str) -> Result<Option<ResumeToken>> {
        Ok(Some(self.inner.with_log(entity_type, |log| {
            ResumeToken::from_sequence(log.len())
        })))
    }
}

#[async_trait]
impl EntityScanner for MemoryChangeSource {
    async fn estimate_count(&self, entity_type: &str) -> Result<Option<u64>> {
        Ok(Some(
            self.inner
                .with_log(entity_type, |log| log.rows.len() as u64),
        ))
    }

    async fn fetch_batch(
        &self,
        entity_type: &str,
        after_key: Option<&str>,
        batch_size: usize,
    ) -> Result<ScanBatch> {
        self.inner.scans.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inner
            .scan_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CdcError::timeout(format!("scan of {} timed out", entity_type)));
        }

        let batch_size = batch_size.max(1);
        Ok(self.inner.with_log(entity_type, |log| {
            let lower = match after_key {
                Some(key) => Bound::Excluded(key.to_string()),
                None => Bound::Unbounded,
            };
            let mut range = log.rows.range((lower, Bound::Unbounded));
            let mut rows = Vec::with_capacity(batch_size);
            let mut last_key = None;
            for (key, row) in range.by_ref().take(batch_size) {
                rows.push(row.clone());
                last_key = Some(key.clone());
            }
            let is_last = range.next().is_none();
            ScanBatch {
                rows,
                last_key,
                is_last,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_from_now_sees_only_new_changes() {
        let source = MemoryChangeSource::new();
        source.insert("users", NativeId::Int(1), json!({"id": 1}));

        let mut stream = source.open_stream("users", None).await.unwrap();
        let token = source.insert("users", NativeId::Int(2), json!({"id": 2}));

        let change = stream.next().await.unwrap().unwrap();
        assert_eq!(change.id, NativeId::Int(2));
        assert_eq!(change.token, token);
    }

    #[tokio::test]
    async fn test_resume_after_token() {
        let source = MemoryChangeSource::new();
        let first = source.insert("users", NativeId::Int(1), json!({"id": 1}));
        source.update("users", NativeId::Int(1), json!({"id": 1, "v": 2}));

        let mut stream = source.open_stream("users", Some(&first)).await.unwrap();
        let change = stream.next().await.unwrap().unwrap();
        assert_eq!(change.operation, NativeOperation::Update);
        assert_eq!(change.token, ResumeToken::from_sequence(2));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let source = MemoryChangeSource::new();
        let first = source.insert("users", NativeId::Int(1), json!({}));
        source.insert("users", NativeId::Int(2), json!({}));
        source.expire_tokens_before("users", 2);

        let err = source.open_stream("users", Some(&first)).await.err().unwrap();
        assert!(matches!(err, CdcError::InvalidResumeToken { .. }));

        let unknown = ResumeToken::new("garbage");
        assert!(source.open_stream("users", Some(&unknown)).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_streams_ends_stream_with_error() {
        let source = MemoryChangeSource::new();
        let mut stream = source.open_stream("users", None).await.unwrap();
        assert_eq!(source.active_streams(), 1);

        source.fail_streams("users");
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());

        drop(stream);
        assert_eq!(source.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_scan_pages_and_failures() {
        let source = MemoryChangeSource::new();
        source.seed_rows("tags", (0..5).map(|i| (NativeId::Int(i), json!({"id": i}))));
        source.delete("tags", NativeId::Int(4));

        let first = source.fetch_batch("tags", None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert!(!first.is_last);

        let second = source
            .fetch_batch("tags", first.last_key.as_deref(), 3)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert!(second.is_last);

        source.fail_next_scans(1);
        assert!(source.fetch_batch("tags", None, 3).await.unwrap_err().is_retriable());
        assert!(source.fetch_batch("tags", None, 3).await.is_ok());
        assert_eq!(source.estimate_count("tags").await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_stream_waits_for_new_changes() {
        let source = Arc::new(MemoryChangeSource::new());
        let mut stream = source.open_stream("users", None).await.unwrap();

        let writer = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.insert("users", NativeId::String("a".into()), json!({}));
        });

        let change = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(change.id, NativeId::String("a".into()));
    }
}
