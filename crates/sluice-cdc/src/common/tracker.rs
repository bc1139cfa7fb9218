//! # Change Tracker
//!
//! Tails the source's change stream for every subscribed entity type and
//! hands each converted [`ChangeEvent`] to an [`EventSink`] (normally the
//! shared [`ChangeQueue`](crate::common::ChangeQueue)).
//!
//! ## Features
//!
//! - **One task per stream**: each entity type is read by its own task
//! - **Backpressure**: a blocking sink blocks the stream task
//! - **Gap fallback**: an expired or unknown resume token reopens the stream
//!   from "now" and is logged as a gap
//! - **Liveness**: a stream that errors or ends is marked dead; the tracker
//!   never reopens it on its own
//!
//! ## Usage
//!
//! ```ignore
//! let tracker = ChangeTracker::new(source, queue.clone());
//! tracker.start(vec![Subscription::new("users").resume_after(token)]).await?;
//!
//! assert!(tracker.is_any_stream_alive());
//! tracker.stop().await;
//! ```

use crate::common::{
    CdcError, ChangeEvent, ChangeSource, ChangeStream, PipelineMetrics, ResumeToken, Result,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Destination for events read from change streams.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event. May wait (backpressure); an error kills the stream.
    async fn send(&self, event: ChangeEvent) -> Result<()>;
}

/// Request to tail one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub entity_type: String,
    /// Resume strictly after this position; `None` starts at "now"
    pub resume_after: Option<ResumeToken>,
}

impl Subscription {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            resume_after: None,
        }
    }

    pub fn resume_after(mut self, token: ResumeToken) -> Self {
        self.resume_after = Some(token);
        self
    }
}

/// Point-in-time status of one entity type's stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub entity_type: String,
    pub alive: bool,
    /// Events handed to the sink
    pub events_emitted: u64,
    /// Token of the last event handed to the sink
    pub last_token: Option<ResumeToken>,
    /// Why the stream died, if it did
    pub last_error: Option<String>,
    /// Position the stream was opened after
    pub resumed_from: Option<ResumeToken>,
    /// The requested resume token was rejected and the stream restarted at "now"
    pub gap_detected: bool,
}

struct TrackedStream {
    status: Arc<RwLock<StreamStatus>>,
    handle: Option<JoinHandle<()>>,
}

/// Opens and supervises per-entity-type change streams.
pub struct ChangeTracker {
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn EventSink>,
    streams: Mutex<HashMap<String, TrackedStream>>,
    cancel: CancellationToken,
    shutdown_timeout: Duration,
    stopped: AtomicBool,
}

impl ChangeTracker {
    pub fn new(source: Arc<dyn ChangeSource>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            source,
            sink,
            streams: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            shutdown_timeout: Duration::from_secs(30),
            stopped: AtomicBool::new(false),
        }
    }

    /// Set how long `stop` waits for stream tasks before aborting them.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Open one stream per subscription.
    ///
    /// May be called repeatedly to add entity types. Fails when a type is
    /// already streaming, when the tracker was stopped, or when none of the
    /// requested streams could be opened. Types that fail to open while
    /// others succeed are reported as dead streams.
    pub async fn start(&self, subscriptions: Vec<Subscription>) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CdcError::shutdown("change tracker stopped"));
        }

        let mut seen = HashSet::new();
        for sub in &subscriptions {
            if !seen.insert(sub.entity_type.as_str()) || self.is_streaming(&sub.entity_type) {
                return Err(CdcError::invalid_state(format!(
                    "entity type '{}' is already streaming",
                    sub.entity_type
                )));
            }
        }

        let requested = subscriptions.len();
        let mut failures = Vec::new();

        for sub in subscriptions {
            let entity_type = sub.entity_type.clone();
            match self.open(&sub).await {
                Ok((stream, gap_detected)) => {
                    self.spawn_stream(sub, stream, gap_detected);
                }
                Err(e) => {
                    error!("Failed to open change stream for {}: {}", entity_type, e);
                    PipelineMetrics::set_stream_alive(&entity_type, false);
                    let status = StreamStatus {
                        entity_type: entity_type.clone(),
                        alive: false,
                        last_error: Some(e.to_string()),
                        resumed_from: sub.resume_after.clone(),
                        ..Default::default()
                    };
                    self.streams.lock().insert(
                        entity_type.clone(),
                        TrackedStream {
                            status: Arc::new(RwLock::new(status)),
                            handle: None,
                        },
                    );
                    failures.push((entity_type, e));
                }
            }
        }

        if requested > 0 && failures.len() == requested {
            let types: Vec<_> = failures.iter().map(|(t, _)| t.as_str()).collect();
            return Err(CdcError::stream(
                types.join(","),
                "no change stream could be opened",
            ));
        }

        Ok(())
    }

    async fn open(&self, sub: &Subscription) -> Result<(ChangeStream, bool)> {
        match self
            .source
            .open_stream(&sub.entity_type, sub.resume_after.as_ref())
            .await
        {
            Ok(stream) => Ok((stream, false)),
            Err(CdcError::InvalidResumeToken { token, .. }) => {
                warn!(
                    entity_type = %sub.entity_type,
                    rejected_token = %token,
                    "Resume token rejected; reopening from now. Changes between the token and now are not replayed"
                );
                PipelineMetrics::record_stream_gap(&sub.entity_type);
                let stream = self.source.open_stream(&sub.entity_type, None).await?;
                Ok((stream, true))
            }
            Err(e) => Err(e),
        }
    }

    fn spawn_stream(&self, sub: Subscription, stream: ChangeStream, gap_detected: bool) {
        let entity_type = sub.entity_type;
        let status = Arc::new(RwLock::new(StreamStatus {
            entity_type: entity_type.clone(),
            alive: true,
            resumed_from: if gap_detected { None } else { sub.resume_after },
            gap_detected,
            ..Default::default()
        }));

        info!("Change stream for {} started", entity_type);
        PipelineMetrics::set_stream_alive(&entity_type, true);

        let handle = tokio::spawn(run_stream(
            entity_type.clone(),
            stream,
            self.sink.clone(),
            status.clone(),
            self.cancel.child_token(),
        ));

        let previous = self.streams.lock().insert(
            entity_type,
            TrackedStream {
                status,
                handle: Some(handle),
            },
        );
        if let Some(handle) = previous.and_then(|p| p.handle) {
            handle.abort();
        }
    }

    /// Stop every stream and wait for the stream tasks to exit.
    ///
    /// Safe to call more than once and concurrently with `start`.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping change tracker");
        self.cancel.cancel();

        let handles: Vec<(String, JoinHandle<()>)> = self
            .streams
            .lock()
            .iter_mut()
            .filter_map(|(t, s)| s.handle.take().map(|h| (t.clone(), h)))
            .collect();

        let deadline = Instant::now() + self.shutdown_timeout;
        for (entity_type, mut handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => debug!("Stream for {} stopped gracefully", entity_type),
                Ok(Err(e)) => warn!("Stream task for {} failed: {}", entity_type, e),
                Err(_) => {
                    handle.abort();
                    warn!("Aborted stream for {} due to timeout", entity_type);
                }
            }
        }

        for stream in self.streams.lock().values() {
            let mut status = stream.status.write();
            if status.alive {
                status.alive = false;
                PipelineMetrics::set_stream_alive(&status.entity_type, false);
            }
        }
        info!("Change tracker stopped");
    }

    /// True while at least one stream is open and healthy.
    pub fn is_any_stream_alive(&self) -> bool {
        self.streams.lock().values().any(|s| s.status.read().alive)
    }

    pub fn is_streaming(&self, entity_type: &str) -> bool {
        self.streams
            .lock()
            .get(entity_type)
            .is_some_and(|s| s.status.read().alive)
    }

    /// Status of every tracked stream, ordered by entity type.
    pub fn stream_status(&self) -> Vec<StreamStatus> {
        let mut statuses: Vec<_> = self
            .streams
            .lock()
            .values()
            .map(|s| s.status.read().clone())
            .collect();
        statuses.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        statuses
    }
}

impl Drop for ChangeTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_stream(
    entity_type: String,
    mut stream: ChangeStream,
    sink: Arc<dyn EventSink>,
    status: Arc<RwLock<StreamStatus>>,
    cancel: CancellationToken,
) {
    let reason: Option<String> = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break None,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(change)) => {
                let token = change.token.clone();
                let event = change.into_event(&entity_type);
                debug!(
                    "Captured {} {} for {} at {}",
                    event.change_kind, event.entity_id, entity_type, token
                );

                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break None,
                    sent = sink.send(event) => sent,
                };
                if let Err(e) = sent {
                    break Some(format!("sink rejected event: {}", e));
                }

                let mut s = status.write();
                s.events_emitted += 1;
                s.last_token = Some(token);
            }
            Some(Err(e)) => break Some(e.to_string()),
            None => break Some("change stream ended".to_string()),
        }
    };

    // Release the source cursor before reporting the stream as down.
    drop(stream);

    let mut s = status.write();
    s.alive = false;
    PipelineMetrics::set_stream_alive(&entity_type, false);
    match reason {
        Some(reason) => {
            error!("Change stream for {} died: {}", entity_type, reason);
            s.last_error = Some(reason);
        }
        None => debug!("Change stream for {} cancelled", entity_type),
    }
}
