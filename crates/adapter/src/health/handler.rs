//! Check handler: serializes the concurrent stream of check results.
//!
//! One handler task per pod monitor, receiving on that pod's result
//! channel. The handler never fails upward: bad results are logged and
//! dropped, a missing notifier is a logged no-op. No lock is held across
//! the notifier call.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PodStatus;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::monitor::{CheckResult, MonitoringState, Subject};
use crate::provider::cache::PodCache;
use crate::provider::NotifierCell;

#[derive(Clone)]
pub struct CheckHandler {
    cache: Arc<PodCache>,
    notifier: NotifierCell,
}

impl CheckHandler {
    pub fn new(cache: Arc<PodCache>, notifier: NotifierCell) -> Self {
        Self { cache, notifier }
    }

    /// Receive results until cancellation (or the channel closing).
    pub(crate) fn spawn(
        self,
        mut results: mpsc::Receiver<CheckResult>,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.changed() => {
                        debug!("Check handler received shutdown, stopping");
                        return;
                    }
                    received = results.recv() => {
                        match received {
                            Some(result) => self.handle(result).await,
                            None => {
                                debug!("Check result channel closed, handler stopping");
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    async fn handle(&self, result: CheckResult) {
        let monitor = &result.monitor;
        let pod_key = monitor.pod_key().clone();

        if result.failed {
            info!(
                monitor = monitor.name(),
                subject = %monitor.subject(),
                pod = %pod_key,
                "Check failure: {}",
                result.message
            );
        } else {
            debug!(
                monitor = monitor.name(),
                subject = %monitor.subject(),
                pod = %pod_key,
                "Check success"
            );
        }

        match monitor.state() {
            MonitoringState::Healthy => {
                debug!(monitor = monitor.name(), pod = %pod_key, "Monitor state is HEALTHY");
            }
            MonitoringState::Unhealthy => match monitor.subject() {
                // log only; the orchestrator reconciles. Recreating the pod
                // here is a possible future policy.
                Subject::AgentChannel => warn!(
                    monitor = monitor.name(),
                    pod = %pod_key,
                    "Agent channel is UNHEALTHY, relying on orchestrator to reconcile"
                ),
                Subject::Application => warn!(
                    monitor = monitor.name(),
                    pod = %pod_key,
                    "Application is UNHEALTHY, relying on orchestrator to reconcile"
                ),
            },
            MonitoringState::Unknown => {
                debug!(monitor = monitor.name(), pod = %pod_key, "Monitor state is UNKNOWN");
            }
        }

        let Some(payload) = result.pod_status else {
            return;
        };

        debug!(pod = %pod_key, "Processing pod status payload");

        let Some(meta) = self.cache.get(&pod_key) else {
            debug!(pod = %pod_key, "Pod no longer cached, dropping status payload");
            return;
        };

        let mut pod = meta.pod;
        let current = pod.status.clone().unwrap_or_default();
        pod.status = Some(merge_status(&current, payload));

        if let Err(err) = self.cache.update_pod(&pod_key, pod.clone()) {
            debug!(pod = %pod_key, "Can't write merged status back: {err}");
            return;
        }

        if !self.notifier.notify(pod) {
            info!(
                pod = %pod_key,
                "Unable to notify pod status (notifier not set)"
            );
        }
    }
}

/// Merge an agent-reported status over the cached one. The agent can't know
/// the addressing fields, so they are preserved from the cache.
fn merge_status(current: &PodStatus, mut payload: PodStatus) -> PodStatus {
    payload.pod_ip = current.pod_ip.clone();
    payload.pod_ips = current.pod_ips.clone();
    payload.host_ip = current.host_ip.clone();
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::health::monitor::{Monitor, ProbeOutcome, StreamFactory, Subject};
    use crate::agent::{AgentError, WatchStream};
    use crate::podutil;
    use crate::provider::cache::{MetaPod, PodKey};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Pod, PodIP};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;

    struct NeverFactory;

    #[async_trait]
    impl StreamFactory for NeverFactory {
        async fn open(&self) -> Result<Box<dyn WatchStream>, AgentError> {
            Err(AgentError::NotReady("unused".to_string()))
        }
    }

    fn test_monitor() -> Arc<Monitor> {
        Monitor::watch(
            Subject::Application,
            "app.watch",
            PodKey::new("default", "app1"),
            Arc::new(NeverFactory),
            HealthConfig::default(),
        )
    }

    fn cached_pod() -> (Arc<PodCache>, PodKey) {
        let cache = Arc::new(PodCache::new());
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("app1".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        podutil::set_pod_ips(&mut pod, "10.0.0.5");
        pod.status.as_mut().unwrap().pod_ips = Some(vec![PodIP {
            ip: "10.0.0.5".to_string(),
        }]);
        let key = PodKey::new("default", "app1");
        cache.set(key.clone(), MetaPod::new(pod, None));
        (cache, key)
    }

    fn recording_notifier() -> (NotifierCell, Arc<Mutex<Vec<Pod>>>) {
        let cell = NotifierCell::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cell.set(Arc::new(move |pod| {
            sink.lock().push(pod);
        }));
        (cell, seen)
    }

    #[tokio::test]
    async fn status_merge_preserves_addressing_fields() {
        let (cache, key) = cached_pod();
        let (notifier, seen) = recording_notifier();
        let handler = CheckHandler::new(cache.clone(), notifier);

        let monitor = test_monitor();
        let payload = PodStatus {
            phase: Some("Running".to_string()),
            message: Some("from agent".to_string()),
            // the agent can't know these; junk must not survive the merge
            pod_ip: Some("192.168.99.99".to_string()),
            host_ip: None,
            ..Default::default()
        };
        let result = monitor.record(ProbeOutcome::success("ok").with_status(Some(payload)));

        handler.handle(result).await;

        let merged = cache.get(&key).unwrap().pod.status.unwrap();
        assert_eq!(merged.pod_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(merged.host_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(merged.pod_ips.as_ref().unwrap()[0].ip, "10.0.0.5");
        // every other field comes from the payload
        assert_eq!(merged.phase.as_deref(), Some("Running"));
        assert_eq!(merged.message.as_deref(), Some("from agent"));

        let notified = seen.lock();
        assert_eq!(notified.len(), 1);
        assert_eq!(
            notified[0].status.as_ref().unwrap().pod_ip.as_deref(),
            Some("10.0.0.5")
        );
    }

    #[tokio::test]
    async fn missing_notifier_is_tolerated() {
        let (cache, key) = cached_pod();
        let handler = CheckHandler::new(cache.clone(), NotifierCell::default());

        let monitor = test_monitor();
        let result = monitor.record(ProbeOutcome::success("ok").with_status(Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        })));

        // must not panic, and the merge still lands in the cache
        handler.handle(result).await;
        assert_eq!(
            cache
                .get(&key)
                .unwrap()
                .pod
                .status
                .unwrap()
                .phase
                .as_deref(),
            Some("Running")
        );
    }

    #[tokio::test]
    async fn results_without_payload_do_not_touch_the_cache() {
        let (cache, key) = cached_pod();
        let (notifier, seen) = recording_notifier();
        let handler = CheckHandler::new(cache.clone(), notifier);

        let monitor = test_monitor();
        let result = monitor.record(ProbeOutcome::failure("boom"));
        handler.handle(result).await;

        assert_eq!(
            cache.get(&key).unwrap().pod.status.unwrap().phase,
            None,
            "status untouched"
        );
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn payload_for_evicted_pod_is_dropped() {
        let cache = Arc::new(PodCache::new());
        let (notifier, seen) = recording_notifier();
        let handler = CheckHandler::new(cache, notifier);

        let monitor = test_monitor();
        let result = monitor.record(ProbeOutcome::success("ok").with_status(Some(
            PodStatus::default(),
        )));

        handler.handle(result).await;
        assert!(seen.lock().is_empty());
    }
}
