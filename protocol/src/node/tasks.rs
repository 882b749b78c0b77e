//! # Per-Peer Task Pool
//!
//! Every task the node starts on behalf of a peer (liveness reader and
//! writer, sync sender and receiver, inbound gossip streams) runs through a
//! [`TaskPool`]:
//!
//! - admission is bounded per kind and never waits: a task whose kind has no
//!   free slot is dropped and counted, so long-lived liveness streams cannot
//!   stall the dispatch loop that starts syncs and gossip;
//! - each task is raced against the root cancellation signal, so shutdown
//!   reclaims stream tasks blocked on a silent peer;
//! - outstanding tasks are counted per kind for the status endpoint.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Task kinds, used as counter keys and in logs.
pub mod kind {
    pub const LIVENESS_WRITER: &str = "liveness-writer";
    pub const LIVENESS_READER: &str = "liveness-reader";
    pub const LIVENESS_INBOUND: &str = "liveness-inbound";
    pub const SYNC_SEND: &str = "sync-send";
    pub const SYNC_RECEIVE: &str = "sync-receive";
    pub const GOSSIP_PUBLISH: &str = "gossip-publish";
    pub const GOSSIP_RECEIVE: &str = "gossip-receive";
}

/// Runs `fut` until it completes or `shutdown` fires. Returns `None` when
/// cancelled, including when the signal had already fired.
pub async fn until_shutdown<F: Future>(
    mut shutdown: watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    if *shutdown.borrow_and_update() {
        return None;
    }
    tokio::select! {
        out = fut => Some(out),
        _ = shutdown.changed() => None,
    }
}

/// Decrements the kind counter when the task ends, however it ends.
struct Outstanding {
    counters: Arc<DashMap<&'static str, usize>>,
    kind: &'static str,
}

impl Outstanding {
    fn enter(counters: &Arc<DashMap<&'static str, usize>>, kind: &'static str) -> Self {
        *counters.entry(kind).or_default() += 1;
        Self {
            counters: Arc::clone(counters),
            kind,
        }
    }
}

impl Drop for Outstanding {
    fn drop(&mut self) {
        if let Some(mut count) = self.counters.get_mut(self.kind) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Bounded, supervised set of per-peer tasks.
pub struct TaskPool {
    max_per_kind: usize,
    budgets: DashMap<&'static str, Arc<Semaphore>>,
    closed: AtomicBool,
    rejected: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    outstanding: Arc<DashMap<&'static str, usize>>,
    shutdown: watch::Receiver<bool>,
}

impl TaskPool {
    /// Creates a pool admitting at most `max_per_kind` concurrent tasks of
    /// each kind.
    pub fn new(max_per_kind: usize, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            max_per_kind: max_per_kind.max(1),
            budgets: DashMap::new(),
            closed: AtomicBool::new(false),
            rejected: AtomicU64::new(0),
            tasks: Mutex::new(JoinSet::new()),
            outstanding: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Starts `fut` as a task of `kind` if that kind has a free slot.
    ///
    /// Never waits. Returns `false` if the kind is at its bound or the pool
    /// is shut down; the task is dropped in both cases.
    pub fn spawn<F>(&self, kind: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match self.try_admit(kind) {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(kind, max = self.max_per_kind, "task budget exhausted, dropping task");
                return false;
            }
            Err(TryAcquireError::Closed) => {
                debug!(kind, "task pool closed, dropping task");
                return false;
            }
        };

        let guard = Outstanding::enter(&self.outstanding, kind);
        let shutdown = self.shutdown.clone();

        let mut tasks = self.tasks.lock();
        reap(&mut tasks);
        tasks.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            if until_shutdown(shutdown, fut).await.is_none() {
                debug!(kind, "task cancelled by shutdown");
            }
        });
        true
    }

    fn try_admit(&self, kind: &'static str) -> Result<OwnedSemaphorePermit, TryAcquireError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TryAcquireError::Closed);
        }
        let budget = self
            .budgets
            .entry(kind)
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_kind)))
            .clone();
        budget.try_acquire_owned()
    }

    /// Tasks dropped because their kind was at its bound.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Total tasks currently running or queued on I/O.
    pub fn outstanding(&self) -> usize {
        self.outstanding.iter().map(|entry| *entry.value()).sum()
    }

    /// Outstanding tasks per kind, zero counts omitted.
    pub fn outstanding_by_kind(&self) -> BTreeMap<&'static str, usize> {
        self.outstanding
            .iter()
            .filter(|entry| *entry.value() > 0)
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Refuses new tasks and aborts the running ones, waiting until they
    /// are gone.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for budget in self.budgets.iter() {
            budget.value().close();
        }
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.shutdown().await;
    }
}

/// Collects finished tasks so the set does not grow without bound.
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                warn!(error = %e, "peer task panicked");
            }
        }
    }
}
