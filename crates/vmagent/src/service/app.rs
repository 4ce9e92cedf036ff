//! ApplicationLifecycle service — demo implementation.
//!
//! Launching stores the pod manifest and synthesizes a running status for
//! it; terminating clears it. A real agent would exec the payload and derive
//! status from the processes it supervises.

use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::Mutex;
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::proto::{
    application_lifecycle_server::ApplicationLifecycle, ApplicationHealthRequest,
    ApplicationHealthResponse, LaunchApplicationRequest, LaunchApplicationResponse,
    TerminateApplicationRequest, TerminateApplicationResponse,
};

/// Seconds between health updates on the watch stream.
const WATCH_INTERVAL_SECS: u64 = 5;

pub struct AppLifecycleService {
    launched: Arc<Mutex<Option<Pod>>>,
}

impl AppLifecycleService {
    pub fn new() -> Self {
        Self {
            launched: Arc::new(Mutex::new(None)),
        }
    }

    /// Synthesize a running status for the launched pod.
    fn running_status(pod: &Pod) -> PodStatus {
        let container_statuses = pod.spec.as_ref().map(|spec| {
            spec.containers
                .iter()
                .map(|container| ContainerStatus {
                    name: container.name.clone(),
                    image: container.image.clone().unwrap_or_default(),
                    ready: true,
                    started: Some(true),
                    restart_count: 0,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning {
                            started_at: Some(Time(Utc::now())),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect()
        });

        PodStatus {
            phase: Some("Running".to_string()),
            message: Some("application launched by vmagent".to_string()),
            container_statuses,
            ..Default::default()
        }
    }

    fn status_json(pod: Option<&Pod>) -> String {
        match pod {
            Some(pod) => serde_json::to_string(&Self::running_status(pod)).unwrap_or_default(),
            None => String::new(),
        }
    }
}

impl Default for AppLifecycleService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl ApplicationLifecycle for AppLifecycleService {
    async fn launch_application(
        &self,
        request: Request<LaunchApplicationRequest>,
    ) -> Result<Response<LaunchApplicationResponse>, Status> {
        let manifest = request.into_inner().pod_manifest_json;

        let pod: Pod = serde_json::from_str(&manifest)
            .map_err(|e| Status::invalid_argument(format!("invalid pod manifest: {e}")))?;

        info!(
            pod = pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
            namespace = pod.metadata.namespace.as_deref().unwrap_or("<none>"),
            "launching application"
        );

        *self.launched.lock().await = Some(pod);

        Ok(Response::new(LaunchApplicationResponse {}))
    }

    async fn terminate_application(
        &self,
        _request: Request<TerminateApplicationRequest>,
    ) -> Result<Response<TerminateApplicationResponse>, Status> {
        let previous = self.launched.lock().await.take();
        match previous {
            Some(pod) => info!(
                pod = pod.metadata.name.as_deref().unwrap_or("<unnamed>"),
                "terminating application"
            ),
            None => warn!("terminate requested but no application is running"),
        }

        Ok(Response::new(TerminateApplicationResponse {}))
    }

    async fn check_application_health(
        &self,
        _request: Request<ApplicationHealthRequest>,
    ) -> Result<Response<ApplicationHealthResponse>, Status> {
        let launched = self.launched.lock().await;

        Ok(Response::new(ApplicationHealthResponse {
            pod_status_json: Self::status_json(launched.as_ref()),
        }))
    }

    type WatchApplicationHealthStream =
        Pin<Box<dyn Stream<Item = Result<ApplicationHealthResponse, Status>> + Send>>;

    async fn watch_application_health(
        &self,
        _request: Request<ApplicationHealthRequest>,
    ) -> Result<Response<Self::WatchApplicationHealthStream>, Status> {
        let launched = self.launched.clone();

        let stream = async_stream::stream! {
            loop {
                let snapshot = launched.lock().await.clone();

                yield Ok(ApplicationHealthResponse {
                    pod_status_json: AppLifecycleService::status_json(snapshot.as_ref()),
                });

                tokio::time::sleep(tokio::time::Duration::from_secs(WATCH_INTERVAL_SECS)).await;
            }
        };

        Ok(Response::new(Box::pin(stream)))
    }
}
