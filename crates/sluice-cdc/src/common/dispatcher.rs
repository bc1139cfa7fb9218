//! # Change Event Dispatcher
//!
//! A fixed pool of workers draining the shared [`ChangeQueue`]. Any worker
//! may receive any entity type's event; routing to handlers happens after
//! dequeue through the [`HandlerRegistry`].
//!
//! ## Per-event flow
//!
//! ```text
//! dequeue ─▶ wait for type's turn ─▶ invoke all bindings ─▶ advance token
//! ```
//!
//! - Handler failures are logged and counted; the token is advanced once
//!   every binding has been attempted.
//! - Events of one entity type complete in queue order even with several
//!   workers: a per-type ticket is taken while the queue's receive lock is
//!   held, and a worker waits for its ticket before handling the event.
//!   Different types proceed in parallel.
//! - Token advancement goes through [`ResumeTokenStore::advance`], which
//!   never moves a stored position backwards.
//!
//! ## Usage
//!
//! ```ignore
//! let dispatcher = ChangeDispatcher::new(queue, registry, store, DispatcherConfig::default());
//! dispatcher.start(3)?;
//! // ...
//! dispatcher.shutdown().await;
//! ```

use crate::common::{
    AdvanceOutcome, CdcError, ChangeEvent, ChangeQueue, DispatcherConfig, HandlerRegistry,
    PipelineMetrics, Result, SharedResumeTokenStore,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Worker pool that turns queued events into handler calls and token advances.
pub struct ChangeDispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    running: AtomicBool,
    stopped: AtomicBool,
    shutdown_timeout: Duration,
}

struct Shared {
    queue: Arc<ChangeQueue>,
    registry: Arc<HandlerRegistry>,
    store: SharedResumeTokenStore,
    dequeue_timeout: Duration,
    stats: DispatcherStats,
    sequencers: Mutex<HashMap<String, Arc<Sequencer>>>,
}

impl ChangeDispatcher {
    pub fn new(
        queue: Arc<ChangeQueue>,
        registry: Arc<HandlerRegistry>,
        store: SharedResumeTokenStore,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                registry,
                store,
                dequeue_timeout: config.dequeue_timeout(),
                stats: DispatcherStats::default(),
                sequencers: Mutex::new(HashMap::new()),
            }),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }

    /// Spawn `worker_count` workers (at least one).
    pub fn start(&self, worker_count: usize) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CdcError::shutdown("dispatcher stopped"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CdcError::invalid_state("dispatcher already started"));
        }

        let worker_count = worker_count.max(1);
        let mut workers = self.workers.lock();
        for id in 0..worker_count {
            let guard = WorkerGuard::new(&self.shared);
            workers.push(tokio::spawn(run_worker(
                id,
                self.shared.clone(),
                self.cancel.child_token(),
                guard,
            )));
        }
        self.shared
            .stats
            .workers
            .store(worker_count as u64, Ordering::Relaxed);

        info!("Change dispatcher started with {} workers", worker_count);
        Ok(())
    }

    /// Cancel every worker and wait for in-flight events to finish, aborting
    /// workers that exceed the shutdown timeout.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);
        info!("Shutting down change dispatcher");
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + self.shutdown_timeout;
        for (id, mut handle) in workers.into_iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => debug!("Dispatcher worker {} stopped gracefully", id),
                Ok(Err(e)) => warn!("Dispatcher worker {} failed: {}", id, e),
                Err(_) => {
                    handle.abort();
                    warn!("Aborted dispatcher worker {} due to timeout", id);
                }
            }
        }

        info!(
            "Change dispatcher stopped ({} events completed)",
            self.completed_count()
        );
    }

    /// True while started, not shut down, and at least one worker is running.
    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
            && self.shared.stats.live_workers.load(Ordering::SeqCst) > 0
    }

    /// Events currently being handled.
    pub fn active_count(&self) -> u64 {
        self.shared.stats.active.load(Ordering::SeqCst)
    }

    /// Events fully handled since start.
    pub fn completed_count(&self) -> u64 {
        self.shared.stats.completed.load(Ordering::SeqCst)
    }

    /// Get statistics.
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wait until the queue is empty and no event is in flight.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        // An item leaves the channel an instant before its worker counts it
        // as active, so idleness must be observed on two consecutive polls.
        let mut was_idle = false;
        loop {
            let idle = self.shared.queue.is_empty() && self.active_count() == 0;
            if idle && was_idle {
                return Ok(());
            }
            was_idle = idle;
            if idle {
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            if !self.is_alive() {
                return Err(CdcError::invalid_state(
                    "cannot drain: dispatcher is not running",
                ));
            }
            if Instant::now() >= deadline {
                return Err(CdcError::timeout(format!(
                    "queue not drained within {:?} ({} queued, {} in flight)",
                    timeout,
                    self.shared.queue.len(),
                    self.active_count()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for ChangeDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_worker(
    id: usize,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    _guard: WorkerGuard,
) {
    debug!("Dispatcher worker {} started", id);

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = shared.queue.recv_with(shared.dequeue_timeout, |event| {
                (shared.ticket(&event.entity_type), ActiveGuard::new(&shared))
            }) => received,
        };

        // Idle timeout; go back to waiting.
        let Some((event, (ticket, _active))) = received else {
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticket.wait_turn() => {}
        }

        shared.process(&event).await;
    }

    debug!("Dispatcher worker {} exiting", id);
}

impl Shared {
    fn ticket(&self, entity_type: &str) -> Ticket {
        let sequencer = self
            .sequencers
            .lock()
            .entry(entity_type.to_string())
            .or_default()
            .clone();
        let number = sequencer.issued.fetch_add(1, Ordering::SeqCst);
        Ticket { sequencer, number }
    }

    async fn process(&self, event: &ChangeEvent) {
        let report = self.registry.invoke(event).await;
        if !report.all_succeeded() {
            self.stats
                .handler_failures
                .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
        }

        if let Some(token) = &event.resume_token {
            match self.store.advance(&event.entity_type, token).await {
                Ok(AdvanceOutcome::Advanced(position)) if &position.last_synced_token == token => {
                    self.stats.token_advances.fetch_add(1, Ordering::Relaxed);
                    PipelineMetrics::record_token_advanced(&event.entity_type);
                }
                Ok(AdvanceOutcome::Advanced(position)) => {
                    error!(
                        entity_type = %event.entity_type,
                        expected = %token,
                        stored = %position.last_synced_token,
                        "Resume token store returned an unexpected position; durable position may be behind"
                    );
                    self.stats.token_errors.fetch_add(1, Ordering::Relaxed);
                    PipelineMetrics::record_token_error(&event.entity_type);
                }
                Ok(AdvanceOutcome::Stale(position)) => {
                    debug!(
                        "Resume token {} for {} not past stored {}",
                        token, event.entity_type, position.last_synced_token
                    );
                    self.stats.token_stale.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(
                        entity_type = %event.entity_type,
                        token = %token,
                        "Failed to persist resume token; durable position may be behind: {}",
                        e
                    );
                    self.stats.token_errors.fetch_add(1, Ordering::Relaxed);
                    PipelineMetrics::record_token_error(&event.entity_type);
                }
            }
        }

        self.stats.completed.fetch_add(1, Ordering::SeqCst);
        PipelineMetrics::record_completed(&event.entity_type);
    }
}

/// Orders completion of one entity type's events.
struct Sequencer {
    issued: AtomicU64,
    done: Mutex<SequencerState>,
    turn: watch::Sender<u64>,
}

impl Default for Sequencer {
    fn default() -> Self {
        let (turn, _) = watch::channel(0);
        Self {
            issued: AtomicU64::new(0),
            done: Mutex::new(SequencerState::default()),
            turn,
        }
    }
}

#[derive(Default)]
struct SequencerState {
    serving: u64,
    finished: BTreeSet<u64>,
}

impl Sequencer {
    fn finish(&self, number: u64) {
        let mut state = self.done.lock();
        state.finished.insert(number);
        let mut serving = state.serving;
        while state.finished.remove(&serving) {
            serving += 1;
        }
        state.serving = serving;
        self.turn.send_replace(serving);
    }
}

/// Place in an entity type's completion order; finishing happens on drop so
/// a cancelled or panicked worker never blocks later events.
struct Ticket {
    sequencer: Arc<Sequencer>,
    number: u64,
}

impl Ticket {
    async fn wait_turn(&self) {
        let mut turn = self.sequencer.turn.subscribe();
        let _ = turn.wait_for(|serving| *serving >= self.number).await;
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.sequencer.finish(self.number);
    }
}

struct ActiveGuard(Arc<Shared>);

impl ActiveGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        let active = shared.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        PipelineMetrics::set_in_flight(active);
        Self(shared.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let active = self.0.stats.active.fetch_sub(1, Ordering::SeqCst) - 1;
        PipelineMetrics::set_in_flight(active);
    }
}

struct WorkerGuard(Arc<Shared>);

impl WorkerGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.stats.live_workers.fetch_add(1, Ordering::SeqCst);
        Self(shared.clone())
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.stats.live_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct DispatcherStats {
    workers: AtomicU64,
    live_workers: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    handler_failures: AtomicU64,
    token_advances: AtomicU64,
    token_stale: AtomicU64,
    token_errors: AtomicU64,
}

impl DispatcherStats {
    fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            workers: self.workers.load(Ordering::Relaxed),
            live_workers: self.live_workers.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            token_advances: self.token_advances.load(Ordering::Relaxed),
            token_stale: self.token_stale.load(Ordering::Relaxed),
            token_errors: self.token_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub workers: u64,
    pub live_workers: u64,
    /// Events currently being handled
    pub active: u64,
    /// Events fully handled
    pub completed: u64,
    /// Failed binding invocations
    pub handler_failures: u64,
    pub token_advances: u64,
    /// Tokens not past the stored position (replays)
    pub token_stale: u64,
    /// Token writes that failed or returned an unexpected position
    pub token_errors: u64,
}
