//! VM agent access: dialing, typed clients, and the capability seam the
//! rest of the adapter consumes.
//!
//! Every pod's VM runs an agent serving the `ApplicationLifecycle` and
//! `Health` services. The concrete gRPC client lives in `client.rs`;
//! `pool.rs` shares one logical connection per ip:port across subsystems.

pub mod client;
pub mod pool;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use thiserror::Error;

pub use client::{AgentClient, GrpcAgentFactory};
pub use pool::AgentPool;

/// Standard Result type for the agent module
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    Status(#[from] tonic::Status),

    #[error("dial to {addr} timed out after {elapsed:?}")]
    DialTimeout { addr: String, elapsed: Duration },

    #[error("stream closed by agent")]
    StreamClosed,

    #[error("agent endpoint not ready: {0}")]
    NotReady(String),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// One message from an agent health stream, normalized across the two
/// stream shapes the agent serves.
#[derive(Debug, Clone, Default)]
pub struct StatusPayload {
    /// Present when the agent reported a pod status alongside the update.
    pub pod_status: Option<PodStatus>,
    pub message: String,
}

/// A live server stream of health updates.
///
/// `recv` blocks for the next update; end-of-stream surfaces as
/// [`AgentError::StreamClosed`] so callers handle EOF and transport errors
/// through one path.
#[async_trait]
pub trait WatchStream: Send {
    async fn recv(&mut self) -> Result<StatusPayload>;
}

/// Everything the adapter asks of one pod's agent. Implemented by
/// [`AgentClient`] over gRPC; tests substitute doubles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentGateway: Send + Sync {
    async fn launch_application(&self, pod: &Pod) -> Result<()>;

    async fn terminate_application(&self) -> Result<()>;

    async fn check_application_health(&self) -> Result<Option<PodStatus>>;

    async fn watch_application_health(&self) -> Result<Box<dyn WatchStream>>;

    async fn watch_health(&self) -> Result<Box<dyn WatchStream>>;

    /// True once a channel to the agent has been established.
    async fn is_connected(&self) -> bool;
}

/// Builds a gateway for an agent endpoint.
pub trait AgentFactory: Send + Sync {
    fn gateway(&self, ip: &str, port: u16) -> Arc<dyn AgentGateway>;
}
