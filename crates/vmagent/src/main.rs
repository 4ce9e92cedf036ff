use std::net::SocketAddr;

use tonic::transport::Server;
use tracing::{info, warn};

use vmagent::proto::application_lifecycle_server::ApplicationLifecycleServer;
use vmagent::proto::health_server::HealthServer;
use vmagent::service::{AgentHealthService, AppLifecycleService};

/// Default gRPC port; must match the adapter's agent connection config.
const DEFAULT_PORT: u16 = 8200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let port = std::env::var("VMAGENT_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    info!("Starting vmagent v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on: {addr}");

    Server::builder()
        .add_service(ApplicationLifecycleServer::new(AppLifecycleService::new()))
        .add_service(HealthServer::new(AgentHealthService::new()))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("vmagent shut down gracefully");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,vmagent=debug"));

    fmt().with_env_filter(filter).with_target(true).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            warn!("Received SIGTERM, shutting down...");
        },
    }
}
