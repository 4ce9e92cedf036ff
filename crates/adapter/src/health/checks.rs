//! Concrete probes wired into every pod's monitor set.
//!
//! Probes hold the pod key, not the pod: the cache is consulted on every
//! execution so a probe always sees the current annotations and IP.

use std::sync::Arc;

use async_trait::async_trait;

use super::monitor::{CheckProbe, ProbeOutcome, StreamFactory};
use crate::agent::{AgentError, AgentGateway, AgentPool, WatchStream};
use crate::metrics;
use crate::podutil;
use crate::provider::cache::{PodCache, PodKey};

/// Shared probe wiring: resolve the pod, then its agent gateway.
#[derive(Clone)]
pub(crate) struct ProbeTarget {
    pub pod_key: PodKey,
    pub cache: Arc<PodCache>,
    pub agents: Arc<AgentPool>,
    pub port: u16,
}

impl ProbeTarget {
    fn gateway(&self) -> Result<Arc<dyn AgentGateway>, AgentError> {
        let meta = self.cache.get(&self.pod_key).ok_or_else(|| {
            AgentError::NotReady(format!("pod {} is not in the cache", self.pod_key))
        })?;

        let ip = podutil::pod_ip(&meta.pod)
            .ok_or_else(|| AgentError::NotReady(format!("pod {} has no ip", self.pod_key)))?;

        Ok(self.agents.gateway_for(ip, self.port))
    }
}

/// Check-type probe: one unary application health call per tick.
pub(crate) struct AppHealthCheck {
    pub target: ProbeTarget,
}

#[async_trait]
impl CheckProbe for AppHealthCheck {
    async fn check(&self) -> ProbeOutcome {
        let gateway = match self.target.gateway() {
            Ok(gateway) => gateway,
            Err(err) => {
                metrics::GRPC_APP_CLIENT_ERRORS.inc();
                return ProbeOutcome::failure(format!(
                    "can't reach agent for pod {}: {err}",
                    self.target.pod_key
                ));
            }
        };

        match gateway.check_application_health().await {
            Ok(pod_status) => ProbeOutcome::success("application health check succeeded")
                .with_status(pod_status),
            Err(err) => {
                metrics::GRPC_APP_CLIENT_ERRORS.inc();
                ProbeOutcome::failure(format!(
                    "can't check application health for pod {}: {err}",
                    self.target.pod_key
                ))
            }
        }
    }
}

/// Watch-type factory: application health stream.
pub(crate) struct AppHealthWatch {
    pub target: ProbeTarget,
}

#[async_trait]
impl StreamFactory for AppHealthWatch {
    async fn open(&self) -> Result<Box<dyn WatchStream>, AgentError> {
        self.target.gateway()?.watch_application_health().await
    }
}

/// Watch-type factory: the agent's own health stream.
pub(crate) struct AgentChannelWatch {
    pub target: ProbeTarget,
}

#[async_trait]
impl StreamFactory for AgentChannelWatch {
    async fn open(&self) -> Result<Box<dyn WatchStream>, AgentError> {
        self.target.gateway()?.watch_health().await
    }
}
