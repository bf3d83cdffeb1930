//! Pool membership and worker selection.
//!
//! The [`WorkerPool`] maps each scheduler address to its [`WorkerSet`] and
//! distributes new queries round-robin across every worker of every ready
//! set. Discovery events (`address_added` / `address_removed`) are the only
//! mutators of membership, and the metric label set changes in the same
//! critical section so the two can never drift apart.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use querygate_core::Error;
use tokio_util::sync::CancellationToken;

use crate::server::metrics::FrontendMetrics;
use crate::server::pool::message::WorkerMessage;
use crate::server::pool::worker::{WorkerHandle, WorkerSet};
use crate::server::registry::PendingRequest;

/// Pool of persistent scheduler streams, keyed by scheduler address.
pub struct WorkerPool {
    sets: Mutex<HashMap<String, WorkerSet>>,
    next_worker: AtomicUsize,
    worker_concurrency: usize,
    frontend_address: String,
    metrics: FrontendMetrics,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        worker_concurrency: usize,
        frontend_address: String,
        metrics: FrontendMetrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sets: Mutex::new(HashMap::new()),
            next_worker: AtomicUsize::new(0),
            worker_concurrency,
            frontend_address,
            metrics,
            shutdown,
        }
    }

    /// Registers a scheduler address and spawns its worker set. The set only
    /// becomes selectable once its first worker completes the INIT
    /// handshake. Duplicate adds are ignored.
    pub fn address_added(&self, address: String) {
        let mut sets = self.sets.lock().expect("poisoned lock");
        if sets.contains_key(&address) {
            tracing::warn!(scheduler = %address, "ignoring duplicate scheduler address");
            return;
        }

        tracing::info!(scheduler = %address, "adding scheduler address");
        let set = WorkerSet::spawn(
            &address,
            self.frontend_address.clone(),
            self.worker_concurrency,
            self.shutdown.child_token(),
        );
        self.metrics.scheduler_added(&address);
        sets.insert(address, set);
    }

    /// Removes a scheduler address: the set leaves the membership (and its
    /// metric series is deleted) atomically, then its workers are stopped
    /// and joined. Requests still waiting on an enqueue ack from this set
    /// observe a shutting-down status and retry elsewhere.
    pub async fn address_removed(&self, address: &str) {
        let set = {
            let mut sets = self.sets.lock().expect("poisoned lock");
            let set = sets.remove(address);
            if set.is_some() {
                self.metrics.scheduler_removed(address);
            }
            set
        };

        match set {
            Some(set) => {
                tracing::info!(scheduler = %address, "removing scheduler address");
                set.shutdown().await;
            }
            None => tracing::warn!(scheduler = %address, "asked to remove unknown scheduler address"),
        }
    }

    /// Hands `pending` to the next live worker, round-robin across every
    /// worker of every ready set, skipping full or closed mailboxes. A whole
    /// rotation without a taker means no scheduler can accept the query.
    pub fn dispatch(&self, pending: &Arc<PendingRequest>) -> Result<WorkerHandle, Error> {
        let workers: Vec<WorkerHandle> = {
            let sets = self.sets.lock().expect("poisoned lock");
            sets.values()
                .filter(|set| set.is_ready())
                .flat_map(|set| set.workers().iter().cloned())
                .collect()
        };
        if workers.is_empty() {
            return Err(Error::NoSchedulers);
        }

        let start = self.next_worker.fetch_add(1, Ordering::Relaxed);
        for i in 0..workers.len() {
            let worker = &workers[(start + i) % workers.len()];
            if worker.offer(WorkerMessage::Enqueue { pending: Arc::clone(pending) }) {
                self.record_enqueued(worker.scheduler_address());
                return Ok(worker.clone());
            }
        }
        Err(Error::NoSchedulers)
    }

    /// Tears down every worker set.
    pub async fn shutdown(&self) {
        let sets: Vec<WorkerSet> = {
            let mut map = self.sets.lock().expect("poisoned lock");
            map.drain()
                .map(|(address, set)| {
                    self.metrics.scheduler_removed(&address);
                    set
                })
                .collect()
        };
        futures::future::join_all(sets.into_iter().map(WorkerSet::shutdown)).await;
    }

    // Increment under the membership lock: a racing removal must not be able
    // to resurrect a deleted label series.
    fn record_enqueued(&self, address: &str) {
        let sets = self.sets.lock().expect("poisoned lock");
        if sets.contains_key(address) {
            self.metrics.inc_enqueued(address);
        }
    }
}
