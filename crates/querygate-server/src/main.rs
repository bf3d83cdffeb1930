use std::sync::Arc;

use clap::Parser;
use querygate_core::proto::frontend_for_worker_server::FrontendForWorkerServer;
use querygate_core::proto::query_frontend_server::QueryFrontendServer;
use querygate_core::proto::FILE_DESCRIPTOR_SET;
use querygate_server::server::config::{CliArgs, DiscoveryMode, ServerConfig};
use querygate_server::server::frontend::{CallerService, Frontend};
use querygate_server::server::metrics::serve_metrics;
use querygate_server::server::telemetry::init_telemetry;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::server::HealthReporter;
use tonic_reflection::server::Builder;

// mimalloc performs noticeably better under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_telemetry();

    let registry = prometheus::Registry::new();
    let frontend = Arc::new(Frontend::new(config.clone(), &registry)?);

    match config.discovery_mode {
        DiscoveryMode::Dns => {
            if config.scheduler_address.is_empty() {
                tracing::warn!("no static scheduler address configured; the pool starts empty");
            }
            frontend.start();
        }
        DiscoveryMode::Ring => {
            tracing::info!("ring discovery enabled; waiting for scheduler address events");
        }
    }

    // The /metrics endpoint runs beside the gRPC server and drains with it.
    let drain = CancellationToken::new();
    let metrics_task = tokio::spawn(serve_metrics(
        registry.clone(),
        config.metrics_addr.clone(),
        drain.clone(),
    ));

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FrontendForWorkerServer<Frontend>>()
        .await;
    health_reporter
        .set_serving::<QueryFrontendServer<CallerService>>()
        .await;

    let reflection = Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(
        address = %config.listen_addr,
        workers = config.worker_concurrency,
        "starting query frontend"
    );

    Server::builder()
        .http2_adaptive_window(Some(true))
        .add_service(health_service)
        .add_service(reflection)
        .add_service(FrontendForWorkerServer::from_arc(Arc::clone(&frontend)))
        .add_service(QueryFrontendServer::new(CallerService::new(Arc::clone(
            &frontend,
        ))))
        .serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            shutdown_signal(Arc::clone(&frontend), health_reporter, drain),
        )
        .await?;

    metrics_task.await??;
    tracing::info!("query frontend shut down cleanly");
    Ok(())
}

async fn shutdown_signal(
    frontend: Arc<Frontend>,
    health_reporter: HealthReporter,
    drain: CancellationToken,
) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }

    tracing::info!("shutdown signal received, terminating gracefully");

    health_reporter
        .set_not_serving::<FrontendForWorkerServer<Frontend>>()
        .await;
    health_reporter
        .set_not_serving::<QueryFrontendServer<CallerService>>()
        .await;

    frontend.shutdown().await;
    drain.cancel();
}
