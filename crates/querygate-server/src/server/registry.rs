//! Per-call coordination state and the process-wide request registry.
//!
//! Every round trip registers a [`PendingRequest`] under its query id for the
//! duration of the call. Scheduler workers deposit enqueue outcomes into the
//! request's status slot, and the result sink delivers the final response
//! into its single-shot response slot. The registry is the only shared
//! lookup structure; the slots themselves are lock-free channel ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use querygate_core::proto::{HttpRequest, QueryResultRequest};
use querygate_core::QueryId;
use tokio::sync::{mpsc, oneshot};

/// Outcome of one enqueue attempt, deposited by the worker that carried the
/// ENQUEUE frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueStatus {
    /// The scheduler accepted the query; the result will arrive out of band.
    Accepted,
    /// The scheduler is draining, or the stream died mid-attempt. The
    /// dispatcher may retry on another worker.
    ShuttingDown,
    /// The tenant has too many outstanding queries; surfaced as HTTP 429.
    TooManyRequests,
    /// The scheduler rejected the query outright.
    Rejected,
}

/// Coordination state for one in-flight round trip.
///
/// Both slots are single-shot: the enqueue slot holds at most one status per
/// attempt (a capacity-1 channel written with `try_send`), and the response
/// slot is a take-once oneshot, so duplicate or late deliveries are dropped
/// rather than observed twice.
pub struct PendingRequest {
    pub query_id: QueryId,
    pub tenant: String,
    pub request: HttpRequest,
    enqueue_tx: mpsc::Sender<EnqueueStatus>,
    response_tx: Mutex<Option<oneshot::Sender<QueryResultRequest>>>,
}

impl PendingRequest {
    /// Builds the request state together with the receiving ends of its two
    /// slots, which stay with the dispatcher.
    pub fn new(
        query_id: QueryId,
        tenant: String,
        request: HttpRequest,
    ) -> (
        Arc<Self>,
        mpsc::Receiver<EnqueueStatus>,
        oneshot::Receiver<QueryResultRequest>,
    ) {
        let (enqueue_tx, enqueue_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = oneshot::channel();
        let pending = Arc::new(Self {
            query_id,
            tenant,
            request,
            enqueue_tx,
            response_tx: Mutex::new(Some(response_tx)),
        });
        (pending, enqueue_rx, response_rx)
    }

    /// Deposits the outcome of an enqueue attempt. A full slot means the
    /// dispatcher has not consumed the previous attempt's status yet; the
    /// extra write is dropped.
    pub fn notify_enqueue(&self, status: EnqueueStatus) {
        let _ = self.enqueue_tx.try_send(status);
    }

    /// Delivers the query result into the response slot. Returns `false`
    /// when the slot was already consumed or the waiter is gone.
    pub fn deliver(&self, result: QueryResultRequest) -> bool {
        let sender = self.response_tx.lock().expect("poisoned lock").take();
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// Process-wide table of in-flight requests, keyed by query id.
#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<QueryId, Arc<PendingRequest>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request for the lifetime of the returned guard.
    /// Dropping the guard unregisters the entry, so no dispatcher exit path
    /// can leak it.
    pub fn register(&self, pending: Arc<PendingRequest>) -> RegistrationGuard<'_> {
        let query_id = pending.query_id;
        self.inner.lock().expect("poisoned lock").insert(query_id, pending);
        RegistrationGuard { registry: self, query_id }
    }

    pub fn lookup(&self, query_id: QueryId) -> Option<Arc<PendingRequest>> {
        self.inner.lock().expect("poisoned lock").get(&query_id).cloned()
    }

    /// Number of registered in-flight requests.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("poisoned lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn unregister(&self, query_id: QueryId) {
        self.inner.lock().expect("poisoned lock").remove(&query_id);
    }
}

/// Removes its request from the registry on drop.
pub struct RegistrationGuard<'a> {
    registry: &'a RequestRegistry,
    query_id: QueryId,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.query_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querygate_core::proto::HttpResponse;

    fn result(code: i32) -> QueryResultRequest {
        QueryResultRequest {
            query_id: 0,
            http_response: Some(HttpResponse { code, ..Default::default() }),
            stats: None,
        }
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = RequestRegistry::new();
        let (pending, _enqueue_rx, _response_rx) =
            PendingRequest::new(7, "tenant".into(), HttpRequest::default());

        {
            let _guard = registry.register(pending);
            assert_eq!(registry.len(), 1);
            assert!(registry.lookup(7).is_some());
            assert!(registry.lookup(8).is_none());
        }

        // Guard dropped: entry must be gone.
        assert!(registry.is_empty());
        assert!(registry.lookup(7).is_none());
    }

    #[tokio::test]
    async fn response_slot_is_single_shot() {
        let (pending, _enqueue_rx, response_rx) =
            PendingRequest::new(1, "tenant".into(), HttpRequest::default());

        assert!(pending.deliver(result(200)));
        assert!(!pending.deliver(result(500)), "second delivery must be dropped");

        let delivered = response_rx.await.expect("first delivery reaches the waiter");
        assert_eq!(delivered.http_response.expect("response set").code, 200);
    }

    #[tokio::test]
    async fn enqueue_slot_keeps_one_status_per_attempt() {
        let (pending, mut enqueue_rx, _response_rx) =
            PendingRequest::new(2, "tenant".into(), HttpRequest::default());

        pending.notify_enqueue(EnqueueStatus::ShuttingDown);
        // Slot full: the extra write is dropped, not queued.
        pending.notify_enqueue(EnqueueStatus::Accepted);

        assert_eq!(enqueue_rx.recv().await, Some(EnqueueStatus::ShuttingDown));
        pending.notify_enqueue(EnqueueStatus::Accepted);
        assert_eq!(enqueue_rx.recv().await, Some(EnqueueStatus::Accepted));
    }
}
