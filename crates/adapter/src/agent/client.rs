//! gRPC client for the in-VM agent.
//!
//! One `AgentClient` per agent endpoint. The channel is dialed lazily on
//! first use: a blocking dial bounded by `TimeoutSeconds` overall, each
//! attempt given `MinConnectTimeoutSeconds`, with exponential backoff
//! between attempts. RPC failures are returned to the caller unchanged —
//! retrying a broken stream is the monitor's job, not the client's.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use rand::Rng;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::Streaming;
use tracing::{debug, info, warn};

use super::{AgentError, AgentFactory, AgentGateway, Result, StatusPayload, WatchStream};
use crate::config::AgentConnectionConfig;

// Include the generated protobuf code
mod proto {
    tonic::include_proto!("vmnode.agent");
}

pub use proto::{
    application_lifecycle_client::ApplicationLifecycleClient,
    health_client::HealthClient,
    health_check_response::ServingStatus,
    ApplicationHealthRequest, ApplicationHealthResponse, HealthCheckRequest, HealthCheckResponse,
    LaunchApplicationRequest, TerminateApplicationRequest,
};

/// Client for one agent endpoint.
///
/// Tonic channels are cheap to clone (Arc internally), so the typed clients
/// handed out by the getters all share the one underlying connection.
pub struct AgentClient {
    address: String,
    port: u16,
    config: AgentConnectionConfig,
    channel: Mutex<Option<Channel>>,
}

impl AgentClient {
    pub fn new(address: impl Into<String>, port: u16, config: AgentConnectionConfig) -> Self {
        Self {
            address: address.into(),
            port,
            config,
            channel: Mutex::new(None),
        }
    }

    fn dial_addr(&self) -> String {
        // plaintext by default; a TLS config hook would switch the scheme
        // and install transport credentials here
        format!("http://{}:{}", self.address, self.port)
    }

    /// Get the shared channel, dialing if this is the first use. The lock is
    /// held across the dial so concurrent callers wait for one connection
    /// instead of racing several.
    async fn channel(&self) -> Result<Channel> {
        let mut guard = self.channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }

        let channel = self.connect().await?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    /// Blocking dial with reconnection backoff, bounded by the configured
    /// overall timeout.
    async fn connect(&self) -> Result<Channel> {
        let dial_addr = self.dial_addr();
        info!("initiating gRPC connection to {dial_addr}");

        let overall = Duration::from_secs(self.config.timeout_seconds);
        let min_connect = Duration::from_secs(self.config.min_connect_timeout_seconds);
        let started = tokio::time::Instant::now();
        let deadline = started + overall;

        let mut delay = Duration::from_secs(self.config.backoff.base_delay_seconds);

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(AgentError::DialTimeout {
                    addr: dial_addr,
                    elapsed: started.elapsed(),
                });
            }
            let attempt_timeout = min_connect.min(remaining);

            let mut endpoint = Endpoint::from_shared(dial_addr.clone())?
                .connect_timeout(attempt_timeout);

            if self.config.keepalive_enabled {
                endpoint = endpoint
                    .http2_keep_alive_interval(Duration::from_secs(
                        self.config.keepalive.time_seconds,
                    ))
                    .keep_alive_timeout(Duration::from_secs(
                        self.config.keepalive.timeout_seconds,
                    ))
                    .keep_alive_while_idle(true);
            }

            match tokio::time::timeout(attempt_timeout, endpoint.connect()).await {
                Ok(Ok(channel)) => {
                    info!(
                        "connection to {dial_addr} established after {:?}",
                        started.elapsed()
                    );
                    return Ok(channel);
                }
                Ok(Err(err)) => {
                    warn!("unable to connect to {dial_addr}: {err} (retrying)");
                }
                Err(_) => {
                    warn!(
                        "connect attempt to {dial_addr} timed out after {:?} (retrying)",
                        attempt_timeout
                    );
                }
            }

            let sleep_for = jittered(delay, self.config.backoff.jitter);
            if tokio::time::Instant::now() + sleep_for >= deadline {
                return Err(AgentError::DialTimeout {
                    addr: dial_addr,
                    elapsed: started.elapsed(),
                });
            }
            debug!("backing off {sleep_for:?} before next connect attempt");
            tokio::time::sleep(sleep_for).await;

            delay = next_delay(
                delay,
                self.config.backoff.multiplier,
                Duration::from_secs(self.config.backoff.max_delay_seconds),
            );
        }
    }

    pub async fn get_application_lifecycle_client(
        &self,
    ) -> Result<ApplicationLifecycleClient<Channel>> {
        Ok(ApplicationLifecycleClient::new(self.channel().await?))
    }

    pub async fn get_health_client(&self) -> Result<HealthClient<Channel>> {
        Ok(HealthClient::new(self.channel().await?))
    }
}

#[async_trait]
impl AgentGateway for AgentClient {
    async fn launch_application(&self, pod: &Pod) -> Result<()> {
        let mut client = self.get_application_lifecycle_client().await?;

        let request = LaunchApplicationRequest {
            pod_manifest_json: serde_json::to_string(pod)?,
        };

        client.launch_application(request).await?;
        Ok(())
    }

    async fn terminate_application(&self) -> Result<()> {
        let mut client = self.get_application_lifecycle_client().await?;

        client
            .terminate_application(TerminateApplicationRequest {})
            .await?;
        Ok(())
    }

    async fn check_application_health(&self) -> Result<Option<PodStatus>> {
        let mut client = self.get_application_lifecycle_client().await?;

        let response = client
            .check_application_health(ApplicationHealthRequest {})
            .await?
            .into_inner();

        decode_pod_status(&response.pod_status_json)
    }

    async fn watch_application_health(&self) -> Result<Box<dyn WatchStream>> {
        let mut client = self.get_application_lifecycle_client().await?;

        let stream = client
            .watch_application_health(ApplicationHealthRequest {})
            .await?
            .into_inner();

        Ok(Box::new(AppHealthStream { inner: stream }))
    }

    async fn watch_health(&self) -> Result<Box<dyn WatchStream>> {
        let mut client = self.get_health_client().await?;

        let stream = client
            .watch(HealthCheckRequest {
                service: String::new(),
            })
            .await?
            .into_inner();

        Ok(Box::new(AgentHealthStream { inner: stream }))
    }

    async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }
}

fn decode_pod_status(json: &str) -> Result<Option<PodStatus>> {
    if json.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(json)?))
}

/// Application health updates mapped onto the common payload shape.
struct AppHealthStream {
    inner: Streaming<ApplicationHealthResponse>,
}

#[async_trait]
impl WatchStream for AppHealthStream {
    async fn recv(&mut self) -> Result<StatusPayload> {
        match self.inner.message().await {
            Ok(Some(response)) => Ok(StatusPayload {
                pod_status: decode_pod_status(&response.pod_status_json)?,
                message: "application health stream received status".to_string(),
            }),
            Ok(None) => Err(AgentError::StreamClosed),
            Err(status) => Err(AgentError::Status(status)),
        }
    }
}

/// Agent-process health updates mapped onto the common payload shape.
struct AgentHealthStream {
    inner: Streaming<HealthCheckResponse>,
}

#[async_trait]
impl WatchStream for AgentHealthStream {
    async fn recv(&mut self) -> Result<StatusPayload> {
        match self.inner.message().await {
            Ok(Some(response)) => {
                let status = ServingStatus::try_from(response.status)
                    .unwrap_or(ServingStatus::Unknown);
                Ok(StatusPayload {
                    pod_status: None,
                    message: format!("agent health stream received status {status:?}"),
                })
            }
            Ok(None) => Err(AgentError::StreamClosed),
            Err(status) => Err(AgentError::Status(status)),
        }
    }
}

/// Builds gRPC-backed gateways with a shared connection config.
pub struct GrpcAgentFactory {
    config: AgentConnectionConfig,
}

impl GrpcAgentFactory {
    pub fn new(config: AgentConnectionConfig) -> Self {
        Self { config }
    }
}

impl AgentFactory for GrpcAgentFactory {
    fn gateway(&self, ip: &str, port: u16) -> Arc<dyn AgentGateway> {
        Arc::new(AgentClient::new(ip, port, self.config.clone()))
    }
}

fn next_delay(current: Duration, multiplier: f64, max: Duration) -> Duration {
    current.mul_f64(multiplier.max(1.0)).min(max)
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let factor = 1.0 + jitter * rand::rng().random_range(-1.0..1.0);
    delay.mul_f64(factor.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    #[test]
    fn next_delay_grows_and_caps() {
        let max = Duration::from_secs(120);
        let d1 = next_delay(Duration::from_secs(1), 1.5, max);
        assert_eq!(d1, Duration::from_millis(1500));

        let capped = next_delay(Duration::from_secs(100), 1.5, max);
        assert_eq!(capped, max);
    }

    #[test]
    fn next_delay_never_shrinks_on_bad_multiplier() {
        let max = Duration::from_secs(120);
        let d = next_delay(Duration::from_secs(2), 0.5, max);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let j = jittered(base, 0.5);
            assert!(j >= Duration::from_secs(5), "jittered too low: {j:?}");
            assert!(j <= Duration::from_secs(15), "jittered too high: {j:?}");
        }
        assert_eq!(jittered(base, 0.0), base);
    }

    #[tokio::test]
    async fn dial_gives_up_at_the_overall_timeout() {
        let config = AgentConnectionConfig {
            timeout_seconds: 1,
            min_connect_timeout_seconds: 1,
            backoff: BackoffConfig {
                base_delay_seconds: 1,
                multiplier: 1.5,
                jitter: 0.0,
                max_delay_seconds: 2,
            },
            ..Default::default()
        };

        // port 1 is never listening
        let client = AgentClient::new("127.0.0.1", 1, config);

        let err = client.get_health_client().await.unwrap_err();
        assert!(
            matches!(err, AgentError::DialTimeout { .. }),
            "unexpected error: {err}"
        );
        assert!(!client.is_connected().await);
    }
}
