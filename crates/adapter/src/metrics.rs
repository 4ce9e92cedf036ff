//! Prometheus counters and the HTTP endpoint that serves them.
//!
//! Counter names are part of the operational contract; dashboards key on
//! them. Keep them stable.

use std::sync::LazyLock;

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tokio::sync::watch;
use tracing::{error, info};

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
}

pub static PODS_CREATED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("vkec2_pods_created_total", "Pods launched by the provider"));

pub static PODS_DELETED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("vkec2_pods_deleted_total", "Pods deleted by the provider"));

pub static EC2_LAUNCHED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("vkec2_ec2_launched_total", "Instances launched for pods"));

pub static EC2_LAUNCH_ERRORS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("vkec2_ec2_launch_errors_total", "Instance launch failures"));

pub static EC2_TERMINATED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("vkec2_ec2_terminated_total", "Instances terminated"));

pub static EC2_TERMINATION_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_ec2_termination_errors_total",
        "Instance termination failures",
    )
});

pub static WARM_EC2_LAUNCHED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_warm_ec2_launched_total",
        "Warm pool instances launched",
    )
});

pub static WARM_EC2_LAUNCH_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_warm_ec2_launch_errors_total",
        "Warm pool instance launch failures",
    )
});

pub static WARM_EC2_TERMINATED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_warm_ec2_terminated_total",
        "Warm pool instances terminated",
    )
});

pub static WARM_EC2_TERMINATION_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_warm_ec2_termination_errors_total",
        "Warm pool instance termination failures",
    )
});

pub static TAG_CREATION_ERRORS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("vkec2_tag_creation_errors_total", "Instance tag write failures"));

pub static HEALTH_STATE_UNHEALTHY: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_health_state_unhealthy_total",
        "Monitors crossing the unhealthy threshold",
    )
});

pub static HEALTH_STATE_RESET: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_health_state_reset_total",
        "Monitor failure counters reset by a success",
    )
});

pub static GRPC_APP_CLIENT_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_grpc_app_client_errors_total",
        "Failures obtaining or calling the agent application client",
    )
});

pub static WATCH_STREAM_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "vkec2_watch_stream_errors_total",
        "Health watch stream receive or connect failures",
    )
});

/// Touch every counter so they all appear in the first scrape.
pub fn register_all() {
    let counters: [&LazyLock<IntCounter>; 15] = [
        &PODS_CREATED,
        &PODS_DELETED,
        &EC2_LAUNCHED,
        &EC2_LAUNCH_ERRORS,
        &EC2_TERMINATED,
        &EC2_TERMINATION_ERRORS,
        &WARM_EC2_LAUNCHED,
        &WARM_EC2_LAUNCH_ERRORS,
        &WARM_EC2_TERMINATED,
        &WARM_EC2_TERMINATION_ERRORS,
        &TAG_CREATION_ERRORS,
        &HEALTH_STATE_UNHEALTHY,
        &HEALTH_STATE_RESET,
        &GRPC_APP_CLIENT_ERRORS,
        &WATCH_STREAM_ERRORS,
    ];
    for c in counters {
        LazyLock::force(c);
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    match encoder.encode(&REGISTRY.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Serve `/metrics` and `/healthz` until the shutdown channel flips.
///
/// Addresses of the form `:10256` bind every interface.
pub async fn serve(address: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    register_all();

    let address = if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    };

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Metrics endpoint listening on http://{address}/metrics");

    axum::serve(listener, router())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}
