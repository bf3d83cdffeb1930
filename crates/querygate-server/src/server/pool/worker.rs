//! Scheduler worker: one task owning one persistent bidirectional stream.
//!
//! Each worker connects to its scheduler, identifies this frontend with an
//! INIT frame, and then serves its mailbox: ENQUEUE frames are sent and
//! their ack awaited on the same stream (acks arrive in send order, so with
//! a single outstanding ENQUEUE the next inbound frame is always the ack);
//! CANCEL frames are fire-and-forget. Any transport error fails the current
//! attempt with a synthetic shutting-down status and reconnects after
//! backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use querygate_core::proto::scheduler_for_frontend_client::SchedulerForFrontendClient;
use querygate_core::proto::{
    FrontendToScheduler, FrontendToSchedulerType, SchedulerStatus, SchedulerToFrontend,
};
use querygate_core::QueryId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;

use crate::server::pool::message::WorkerMessage;
use crate::server::pool::WORKER_MAILBOX_CAPACITY;
use crate::server::registry::EnqueueStatus;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Cloneable handle to one worker's mailbox.
///
/// The dispatcher keeps the handle that accepted an enqueue so a later
/// CANCEL reaches the same worker, and therefore the same stream.
#[derive(Clone)]
pub struct WorkerHandle {
    addr: Arc<str>,
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    /// Non-blocking hand-off. Returns `false` when the mailbox is full or
    /// the worker is gone.
    pub(crate) fn offer(&self, msg: WorkerMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Best-effort CANCEL toward the scheduler that enqueued `query_id`. A
    /// full mailbox or an already-stopped worker drops the cancel; the
    /// scheduler copes through its own timeout.
    pub fn try_cancel(&self, query_id: QueryId) {
        if !self.offer(WorkerMessage::Cancel { query_id }) {
            tracing::debug!(query_id, scheduler = %self.addr, "dropped cancel for unreachable worker");
        }
    }

    pub fn scheduler_address(&self) -> &str {
        &self.addr
    }
}

/// Fixed-size group of workers for one scheduler address.
///
/// The set reports ready once its first worker has completed the INIT
/// handshake; the pool only selects workers from ready sets.
pub(crate) struct WorkerSet {
    addr: Arc<str>,
    ready: Arc<AtomicBool>,
    token: CancellationToken,
    workers: Vec<WorkerHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub(crate) fn spawn(
        addr: &str,
        frontend_address: String,
        concurrency: usize,
        token: CancellationToken,
    ) -> Self {
        let addr: Arc<str> = Arc::from(addr);
        let ready = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(concurrency);
        let mut tasks = Vec::with_capacity(concurrency);

        for worker_id in 0..concurrency {
            let (tx, rx) = mpsc::channel(WORKER_MAILBOX_CAPACITY);
            workers.push(WorkerHandle { addr: Arc::clone(&addr), tx });
            tasks.push(tokio::spawn(worker_loop(WorkerContext {
                worker_id,
                addr: Arc::clone(&addr),
                frontend_address: frontend_address.clone(),
                ready: Arc::clone(&ready),
                token: token.clone(),
                rx,
            })));
        }

        Self { addr, ready, token, workers, tasks }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Stops every worker and waits for termination. Queued enqueues observe
    /// a synthetic shutting-down status so their round trips retry.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::error!(scheduler = %self.addr, %err, "worker task failed during shutdown");
            }
        }
    }
}

struct WorkerContext {
    worker_id: usize,
    addr: Arc<str>,
    frontend_address: String,
    ready: Arc<AtomicBool>,
    token: CancellationToken,
    rx: mpsc::Receiver<WorkerMessage>,
}

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error(transparent)]
    Rpc(#[from] tonic::Status),
    #[error("scheduler rejected stream init with status {0}")]
    InitRejected(i32),
    #[error("scheduler closed the stream")]
    Closed,
}

async fn worker_loop(mut ctx: WorkerContext) {
    tracing::debug!(worker_id = ctx.worker_id, scheduler = %ctx.addr, "worker started");

    let mut backoff = MIN_BACKOFF;
    while !ctx.token.is_cancelled() {
        match run_stream(&mut ctx, &mut backoff).await {
            Ok(()) => break,
            Err(err) => {
                tracing::warn!(
                    worker_id = ctx.worker_id,
                    scheduler = %ctx.addr,
                    %err,
                    "scheduler stream failed"
                );
                // Fail queued attempts over to other workers instead of
                // holding them across the backoff.
                drain_mailbox(&mut ctx.rx);
                tokio::select! {
                    () = ctx.token.cancelled() => break,
                    () = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    ctx.rx.close();
    drain_mailbox(&mut ctx.rx);
    tracing::debug!(worker_id = ctx.worker_id, scheduler = %ctx.addr, "worker stopped");
}

/// Runs one stream lifetime: connect, INIT handshake, then the mailbox loop.
/// Returns `Ok(())` only on shutdown.
async fn run_stream(ctx: &mut WorkerContext, backoff: &mut Duration) -> Result<(), StreamError> {
    let endpoint = Endpoint::from_shared(format!("http://{}", ctx.addr))?
        .connect_timeout(CONNECT_TIMEOUT);
    let channel = tokio::select! {
        () = ctx.token.cancelled() => return Ok(()),
        conn = endpoint.connect() => conn?,
    };
    let mut client = SchedulerForFrontendClient::new(channel);

    let (frame_tx, frame_rx) = mpsc::channel::<FrontendToScheduler>(WORKER_MAILBOX_CAPACITY);
    let mut inbound = client
        .frontend_loop(ReceiverStream::new(frame_rx))
        .await?
        .into_inner();

    // Every stream starts with exactly one INIT, acked with a single OK.
    send_frame(
        &frame_tx,
        FrontendToScheduler {
            r#type: FrontendToSchedulerType::Init as i32,
            frontend_address: ctx.frontend_address.clone(),
            ..Default::default()
        },
    )
    .await?;
    let ack = inbound.message().await?.ok_or(StreamError::Closed)?;
    if ack.status != SchedulerStatus::Ok as i32 {
        return Err(StreamError::InitRejected(ack.status));
    }

    ctx.ready.store(true, Ordering::Release);
    *backoff = MIN_BACKOFF;
    tracing::debug!(worker_id = ctx.worker_id, scheduler = %ctx.addr, "connected to scheduler");

    loop {
        let msg = tokio::select! {
            () = ctx.token.cancelled() => return Ok(()),
            msg = ctx.rx.recv() => match msg {
                Some(msg) => msg,
                None => return Ok(()),
            },
        };

        match msg {
            WorkerMessage::Enqueue { pending } => {
                let frame = FrontendToScheduler {
                    r#type: FrontendToSchedulerType::Enqueue as i32,
                    frontend_address: ctx.frontend_address.clone(),
                    query_id: pending.query_id,
                    tenant_id: pending.tenant.clone(),
                    http_request: Some(pending.request.clone()),
                };
                if let Err(err) = send_frame(&frame_tx, frame).await {
                    pending.notify_enqueue(EnqueueStatus::ShuttingDown);
                    return Err(err);
                }

                let ack = tokio::select! {
                    () = ctx.token.cancelled() => {
                        pending.notify_enqueue(EnqueueStatus::ShuttingDown);
                        return Ok(());
                    }
                    frame = inbound.message() => match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            pending.notify_enqueue(EnqueueStatus::ShuttingDown);
                            return Err(StreamError::Closed);
                        }
                        Err(status) => {
                            pending.notify_enqueue(EnqueueStatus::ShuttingDown);
                            return Err(status.into());
                        }
                    },
                };
                pending.notify_enqueue(translate_ack(&ack));
            }
            WorkerMessage::Cancel { query_id } => {
                send_frame(
                    &frame_tx,
                    FrontendToScheduler {
                        r#type: FrontendToSchedulerType::Cancel as i32,
                        query_id,
                        ..Default::default()
                    },
                )
                .await?;
            }
        }
    }
}

fn translate_ack(ack: &SchedulerToFrontend) -> EnqueueStatus {
    match SchedulerStatus::try_from(ack.status) {
        Ok(SchedulerStatus::Ok) => EnqueueStatus::Accepted,
        Ok(SchedulerStatus::ShuttingDown) => EnqueueStatus::ShuttingDown,
        Ok(SchedulerStatus::TooManyRequestsPerTenant) => EnqueueStatus::TooManyRequests,
        Ok(SchedulerStatus::Error) | Err(_) => {
            if !ack.error.is_empty() {
                tracing::warn!(error = %ack.error, "scheduler rejected enqueue");
            }
            EnqueueStatus::Rejected
        }
    }
}

fn drain_mailbox(rx: &mut mpsc::Receiver<WorkerMessage>) {
    while let Ok(msg) = rx.try_recv() {
        if let WorkerMessage::Enqueue { pending } = msg {
            pending.notify_enqueue(EnqueueStatus::ShuttingDown);
        }
    }
}

async fn send_frame(
    tx: &mpsc::Sender<FrontendToScheduler>,
    frame: FrontendToScheduler,
) -> Result<(), StreamError> {
    tx.send(frame).await.map_err(|_| StreamError::Closed)
}
