use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use adapter::agent::{AgentPool, GrpcAgentFactory};
use adapter::compute::FakeCompute;
use adapter::config::ProviderConfig;
use adapter::k8s;
use adapter::metrics;
use adapter::provider::VmProvider;

#[derive(Parser, Debug)]
#[command(name = "adapter", about = "VM-backed virtual node adapter")]
struct Args {
    /// Path to the JSON provider configuration
    #[arg(long)]
    config: Option<String>,

    /// Logical node name (overrides the config's NodeName)
    #[arg(long)]
    node_name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ProviderConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;

    init_tracing(&config);

    info!("Starting vmnode adapter v{}", env!("CARGO_PKG_VERSION"));

    let node_name = args
        .node_name
        .or_else(|| {
            let configured = config.node_name.clone();
            (!configured.is_empty()).then_some(configured)
        })
        .unwrap_or_else(|| "vmnode".to_string());
    info!("Operating as node: {node_name}");

    let config = Arc::new(config);
    let (shutdown_tx, _) = tokio::sync::watch::channel(false);

    // seed the pod cache with everything already scheduled to this node
    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to build orchestrator client")?;
    let seeded = k8s::seed_pod_cache(kube_client, &node_name)
        .await
        .context("Failed to seed pod cache from orchestrator")?;

    // the compute driver is an injection point; this binary wires the
    // in-memory driver so the adapter runs without cloud credentials
    warn!("Using in-memory compute driver; instances are simulated");
    let driver = Arc::new(FakeCompute::new());

    let agents = Arc::new(AgentPool::new(Arc::new(GrpcAgentFactory::new(
        config.agent_connection.clone(),
    ))));

    let provider = Arc::new(VmProvider::new(
        config.clone(),
        node_name,
        driver,
        agents,
        seeded,
    ));

    // recreate monitors for rehydrated pods
    provider.populate_cache().await;

    // warm pool startup fill + maintenance loops
    let warm_pool = provider.warm_pool().clone();
    warm_pool.initial_fill().await;
    let warm_pool_tasks = warm_pool.spawn_loops(shutdown_tx.subscribe());

    // metrics endpoint
    let metrics_task = {
        let address = config.metrics_address.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(err) = metrics::serve(&address, shutdown).await {
                warn!("Metrics endpoint failed: {err}");
            }
        })
    };

    info!("vmnode adapter is ready");

    shutdown_signal().await;

    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    provider.stop_all_monitors().await;
    for task in warm_pool_tasks {
        let _ = task.await;
    }
    let _ = metrics_task.await;

    info!("vmnode adapter shut down gracefully");
    Ok(())
}

fn init_tracing(config: &ProviderConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        fmt().with_env_filter(filter).with_target(true).init();
    }
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
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
