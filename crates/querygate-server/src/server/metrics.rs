//! Prometheus metrics and the /metrics exposition endpoint.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;

/// Counters whose `scheduler_address` label set tracks pool membership: a
/// series appears (at 0) when an address joins the fleet and is deleted when
/// the address leaves, because a stale zero series would misrepresent the
/// fleet.
#[derive(Clone)]
pub struct FrontendMetrics {
    enqueued_requests: IntCounterVec,
}

impl FrontendMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let enqueued_requests = IntCounterVec::new(
            Opts::new(
                "workers_enqueued_requests_total",
                "Total number of requests enqueued by each frontend worker \
                 (regardless of the result), labeled by scheduler address.",
            )
            .namespace("querygate"),
            &["scheduler_address"],
        )?;
        registry.register(Box::new(enqueued_requests.clone()))?;
        Ok(Self { enqueued_requests })
    }

    /// Creates the label series for a newly added scheduler address.
    pub fn scheduler_added(&self, address: &str) {
        self.enqueued_requests.with_label_values(&[address]);
    }

    /// Deletes the label series of a removed scheduler address.
    pub fn scheduler_removed(&self, address: &str) {
        if let Err(err) = self.enqueued_requests.remove_label_values(&[address]) {
            tracing::debug!(scheduler = %address, %err, "no metric series to remove");
        }
    }

    pub fn inc_enqueued(&self, address: &str) {
        self.enqueued_requests.with_label_values(&[address]).inc();
    }
}

/// Serves `registry` in the Prometheus text exposition format at `/metrics`
/// until `cancel` fires.
pub async fn serve_metrics(
    registry: Registry,
    addr: String,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let registry = registry.clone();
            async move { render(&registry) }
        }),
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn render(registry: &Registry) -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&registry.gather(), &mut buf) {
        tracing::error!(%err, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
