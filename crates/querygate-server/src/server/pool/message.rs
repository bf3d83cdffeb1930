use std::sync::Arc;

use querygate_core::QueryId;

use crate::server::registry::PendingRequest;

/// A message sent from the dispatcher to a scheduler worker task.
///
/// [`WorkerMessage`] values travel over the bounded per-worker mailboxes and
/// are processed inside each worker's stream loop, in order. Keeping a
/// query's CANCEL on the mailbox of the worker that carried its ENQUEUE is
/// what guarantees the scheduler sees the two frames in order.
pub enum WorkerMessage {
    /// Carry one query to the scheduler and deposit the resulting status
    /// into the pending request's enqueue slot.
    Enqueue { pending: Arc<PendingRequest> },

    /// Ask the scheduler to abandon a previously enqueued query. No ack is
    /// expected.
    Cancel { query_id: QueryId },
}
