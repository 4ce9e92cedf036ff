//! Health service — reports on the agent process itself.
//!
//! A live agent is a serving agent: the process answering the RPC is the
//! resource being probed, so check always reports SERVING and the watch
//! stream repeats it on an interval.

use std::pin::Pin;

use tokio_stream::Stream;
use tonic::{Request, Response, Status};

use crate::proto::{
    health_check_response::ServingStatus, health_server::Health, HealthCheckRequest,
    HealthCheckResponse,
};

/// Seconds between updates on the watch stream.
const WATCH_INTERVAL_SECS: u64 = 5;

pub struct AgentHealthService;

impl AgentHealthService {
    pub fn new() -> Self {
        Self
    }

    fn serving() -> HealthCheckResponse {
        HealthCheckResponse {
            status: ServingStatus::Serving as i32,
            message: "vmagent is serving".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

impl Default for AgentHealthService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Health for AgentHealthService {
    async fn check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        Ok(Response::new(Self::serving()))
    }

    type WatchStream = Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>;

    async fn watch(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let stream = async_stream::stream! {
            loop {
                yield Ok(AgentHealthService::serving());

                tokio::time::sleep(tokio::time::Duration::from_secs(WATCH_INTERVAL_SECS)).await;
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}
