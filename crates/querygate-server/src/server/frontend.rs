//! The dispatcher: synchronous round trips coordinated against scheduler
//! acks, out-of-band result deliveries and caller cancellation.
//!
//! [`Frontend`] is the public entry point of the service. Each
//! [`Frontend::round_trip`] allocates a query id, registers a pending
//! request, hands it to a pool worker and then multiplexes three event
//! sources: the enqueue-status slot, the response slot, and the caller's
//! [`QueryContext`]. The same type also implements the result-sink gRPC
//! service that worker processes call once a query has executed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use querygate_core::proto::frontend_for_worker_server::FrontendForWorker;
use querygate_core::proto::query_frontend_server::QueryFrontend;
use querygate_core::proto::{HttpRequest, HttpResponse, QueryResultRequest, QueryResultResponse};
use querygate_core::{deadline_from_metadata, tenant_from_metadata, Error, QueryId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::server::config::ServerConfig;
use crate::server::metrics::FrontendMetrics;
use crate::server::pool::{WorkerHandle, WorkerPool};
use crate::server::registry::{EnqueueStatus, PendingRequest, RequestRegistry};

/// Caller-side context for one round trip: the tenant the call acts for, an
/// optional deadline, and a cancellation handle. Clones share the same
/// cancellation state.
#[derive(Debug, Clone)]
pub struct QueryContext {
    tenant: Option<String>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryContext {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A context without a tenant; round trips using it fail with
    /// [`Error::MissingTenant`].
    pub fn anonymous() -> Self {
        Self { tenant: None, deadline: None, cancel: CancellationToken::new() }
    }

    /// Sets a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Cancels every round trip using this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    async fn done(&self) {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancel.cancelled() => {}
                () = tokio::time::sleep_until(deadline) => {}
            },
            None => self.cancel.cancelled().await,
        }
    }

    /// The error describing why the context terminated.
    fn err(&self) -> Error {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Error::DeadlineExceeded,
            _ => Error::Cancelled,
        }
    }
}

/// The query-frontend dispatcher.
///
/// Owns the request registry and the scheduler worker pool, allocates query
/// ids from a process-wide counter, and coordinates each round trip until a
/// result, a failure, or caller cancellation settles it.
pub struct Frontend {
    cfg: ServerConfig,
    requests: RequestRegistry,
    pool: WorkerPool,
    next_query_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Frontend {
    /// Builds a frontend whose metrics register on `registry`.
    pub fn new(cfg: ServerConfig, registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = FrontendMetrics::new(registry)?;
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(
            cfg.worker_concurrency,
            cfg.frontend_address(),
            metrics,
            shutdown.child_token(),
        );
        Ok(Self {
            cfg,
            requests: RequestRegistry::new(),
            pool,
            next_query_id: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Connects the pool to the statically configured scheduler, when one is
    /// set. Ring-discovered deployments instead drive [`Self::address_added`]
    /// and [`Self::address_removed`] from their watcher.
    pub fn start(&self) {
        if !self.cfg.scheduler_address.is_empty() {
            self.pool.address_added(self.cfg.scheduler_address.clone());
        }
    }

    /// Discovery event: a scheduler address joined the fleet.
    pub fn address_added(&self, address: String) {
        self.pool.address_added(address);
    }

    /// Discovery event: a scheduler address left the fleet.
    pub async fn address_removed(&self, address: &str) {
        self.pool.address_removed(address).await;
    }

    /// Number of round trips currently in flight.
    pub fn inflight(&self) -> usize {
        self.requests.len()
    }

    /// Stops the frontend: waiting round trips fail with
    /// [`Error::ServiceShutdown`] and every worker set is drained and joined.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }

    /// Submits one query to the scheduler fleet and waits for its result.
    ///
    /// Returns the scheduler-delivered response, a synthesized 429 response
    /// when the tenant hit its quota, or an error. Honours cancellation and
    /// deadline on `ctx`; a cancelled round trip emits a best-effort CANCEL
    /// toward the scheduler that holds the query.
    pub async fn round_trip(
        &self,
        ctx: &QueryContext,
        request: HttpRequest,
    ) -> Result<HttpResponse, Error> {
        let tenant = ctx.tenant().ok_or(Error::MissingTenant)?;
        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed) + 1;

        let (pending, mut enqueue_rx, response_rx) =
            PendingRequest::new(query_id, tenant.to_owned(), request);
        let _registration = self.requests.register(Arc::clone(&pending));
        let mut cancel = CancelOnDrop { worker: None, query_id };

        tracing::debug!(query_id, tenant, "dispatching query");

        // Enqueue, retrying while schedulers report they are draining. The
        // budget equals the pool's per-address parallelism, which bounds
        // retry amplification and guarantees termination even when every
        // backend drains at once.
        let mut attempts = self.cfg.worker_concurrency;
        loop {
            if attempts == 0 {
                return Err(Error::EnqueueFailed);
            }
            attempts -= 1;

            cancel.worker = Some(self.pool.dispatch(&pending)?);

            tokio::select! {
                status = enqueue_rx.recv() => match status {
                    Some(EnqueueStatus::Accepted) => break,
                    Some(EnqueueStatus::ShuttingDown) => {
                        cancel.disarm();
                        continue;
                    }
                    Some(EnqueueStatus::TooManyRequests) => {
                        cancel.disarm();
                        return Ok(HttpResponse { code: 429, ..Default::default() });
                    }
                    Some(EnqueueStatus::Rejected) | None => {
                        cancel.disarm();
                        return Err(Error::EnqueueFailed);
                    }
                },
                () = ctx.done() => return Err(ctx.err()),
                () = self.shutdown.cancelled() => return Err(Error::ServiceShutdown),
            }
        }

        tokio::select! {
            result = response_rx => match result {
                Ok(result) => {
                    cancel.disarm();
                    tracing::debug!(query_id, "query result received");
                    Ok(result.http_response.unwrap_or_default())
                }
                Err(_) => Err(Error::ChannelError {
                    context: format!("response slot for query {query_id} closed"),
                }),
            },
            () = ctx.done() => Err(ctx.err()),
            () = self.shutdown.cancelled() => Err(Error::ServiceShutdown),
        }
    }
}

/// Arms a best-effort CANCEL toward the worker that accepted the enqueue.
///
/// Firing on drop covers every exit path, including a round-trip future
/// dropped by a disconnecting caller. Disarmed once the query no longer
/// lives on a scheduler.
struct CancelOnDrop {
    worker: Option<WorkerHandle>,
    query_id: QueryId,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.worker = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.try_cancel(self.query_id);
        }
    }
}

#[tonic::async_trait]
impl FrontendForWorker for Frontend {
    /// Out-of-band result delivery from a worker process.
    ///
    /// Unknown query ids are acknowledged silently: the caller has already
    /// given up, and late results are discarded. A delivery whose tenant
    /// does not match the registered query is rejected.
    async fn deliver_result(
        &self,
        request: Request<QueryResultRequest>,
    ) -> Result<Response<QueryResultResponse>, Status> {
        let tenant = tenant_from_metadata(request.metadata())
            .ok_or_else(|| Status::from(Error::MissingTenant))?;
        let result = request.into_inner();
        let query_id = result.query_id;

        let Some(pending) = self.requests.lookup(query_id) else {
            tracing::debug!(query_id, "discarding result for unknown query");
            return Ok(Response::new(QueryResultResponse {}));
        };

        if pending.tenant != tenant {
            let err = Error::TenantMismatch { expected: pending.tenant.clone(), got: tenant };
            tracing::warn!(query_id, %err, "rejecting result delivery");
            return Err(err.into());
        }

        if let Some(stats) = &result.stats {
            tracing::debug!(
                query_id,
                wall_time_ms = stats.wall_time_ms,
                fetched_bytes = stats.fetched_bytes,
                "query executed"
            );
        }

        if !pending.deliver(result) {
            tracing::debug!(query_id, "dropping duplicate result delivery");
        }
        Ok(Response::new(QueryResultResponse {}))
    }
}

/// Thin gRPC surface for upstream callers. The tenant and the caller's
/// `grpc-timeout`, when one is set, travel on the call metadata; a
/// disconnecting caller additionally cancels through the dropped handler
/// future.
pub struct CallerService {
    frontend: Arc<Frontend>,
}

impl CallerService {
    pub fn new(frontend: Arc<Frontend>) -> Self {
        Self { frontend }
    }
}

#[tonic::async_trait]
impl QueryFrontend for CallerService {
    async fn round_trip(
        &self,
        request: Request<HttpRequest>,
    ) -> Result<Response<HttpResponse>, Status> {
        let tenant = tenant_from_metadata(request.metadata())
            .ok_or_else(|| Status::from(Error::MissingTenant))?;
        let mut ctx = QueryContext::new(tenant);
        if let Some(timeout) = deadline_from_metadata(request.metadata()) {
            ctx = ctx.with_timeout(timeout);
        }
        let response = self
            .frontend
            .round_trip(&ctx, request.into_inner())
            .await
            .map_err(Status::from)?;
        Ok(Response::new(response))
    }
}
