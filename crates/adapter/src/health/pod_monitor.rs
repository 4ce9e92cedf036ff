//! Per-pod monitoring: the fixed monitor set and its lifecycle.
//!
//! Every realized pod owns one `PodMonitor`: the agent-channel watcher, the
//! application watcher, and an application check poller. All of a pod's
//! probe tasks share one cancel channel; `stop` flips it and joins every
//! task, so when it returns nothing of the pod's monitoring is left running.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::checks::{AgentChannelWatch, AppHealthCheck, AppHealthWatch, ProbeTarget};
use super::handler::CheckHandler;
use super::monitor::{CheckResult, Monitor, Subject};
use crate::agent::AgentPool;
use crate::config::ProviderConfig;
use crate::provider::cache::{PodCache, PodKey};
use crate::provider::NotifierCell;

/// Capacity of the monitor → handler channel.
const RESULT_CHANNEL_CAPACITY: usize = 16;

/// Everything a pod monitor needs from the rest of the adapter.
#[derive(Clone)]
pub struct MonitorDeps {
    pub cache: Arc<PodCache>,
    pub agents: Arc<AgentPool>,
    pub config: Arc<ProviderConfig>,
    pub notifier: NotifierCell,
}

pub struct PodMonitor {
    pod_key: PodKey,
    monitors: Vec<Arc<Monitor>>,
    handler: CheckHandler,
    cancel: watch::Sender<bool>,
    results_tx: mpsc::Sender<CheckResult>,
    results_rx: SyncMutex<Option<mpsc::Receiver<CheckResult>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PodMonitor {
    pub fn new(pod: &Pod, deps: &MonitorDeps) -> Self {
        let pod_key = PodKey::from_pod(pod);
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let (cancel, _) = watch::channel(false);

        let target = ProbeTarget {
            pod_key: pod_key.clone(),
            cache: deps.cache.clone(),
            agents: deps.agents.clone(),
            port: deps.config.agent_connection.port,
        };
        let health = deps.config.health.clone();

        let monitors = vec![
            Monitor::watch(
                Subject::AgentChannel,
                "agent.watch",
                pod_key.clone(),
                Arc::new(AgentChannelWatch {
                    target: target.clone(),
                }),
                health.clone(),
            ),
            Monitor::watch(
                Subject::Application,
                "app.watch",
                pod_key.clone(),
                Arc::new(AppHealthWatch {
                    target: target.clone(),
                }),
                health.clone(),
            ),
            Monitor::check(
                Subject::Application,
                "app.health",
                pod_key.clone(),
                Arc::new(AppHealthCheck { target }),
                health,
            ),
        ];

        Self {
            pod_key,
            monitors,
            handler: CheckHandler::new(deps.cache.clone(), deps.notifier.clone()),
            cancel,
            results_tx,
            results_rx: SyncMutex::new(Some(results_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn pod_key(&self) -> &PodKey {
        &self.pod_key
    }

    pub fn monitors(&self) -> &[Arc<Monitor>] {
        &self.monitors
    }

    /// True while any probe task runs.
    pub fn is_monitoring(&self) -> bool {
        self.monitors.iter().any(|m| m.is_monitoring())
    }

    /// Start the handler task and one task per monitor. Idempotent: a second
    /// call is a logged no-op.
    pub async fn start(&self) {
        let receiver = self.results_rx.lock().take();
        let Some(receiver) = receiver else {
            warn!(pod = %self.pod_key, "Pod monitor already started, ignoring");
            return;
        };

        info!(
            pod = %self.pod_key,
            monitors = self.monitors.len(),
            "Starting pod monitor"
        );

        let mut tasks = self.tasks.lock().await;
        tasks.push(
            self.handler
                .clone()
                .spawn(receiver, self.cancel.subscribe()),
        );
        for monitor in &self.monitors {
            tasks.push(
                monitor
                    .clone()
                    .run(self.results_tx.clone(), self.cancel.subscribe()),
            );
        }
    }

    /// Signal every task and wait for all of them to exit.
    pub async fn stop(&self) {
        info!(pod = %self.pod_key, "Stopping pod monitor");

        let _ = self.cancel.send(true);

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        info!(pod = %self.pod_key, "Pod monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentFactory, AgentGateway, MockAgentGateway};
    use crate::health::monitor::MonitoringState;
    use crate::provider::cache::MetaPod;
    use crate::podutil;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    struct StaticFactory(Arc<dyn AgentGateway>);

    impl AgentFactory for StaticFactory {
        fn gateway(&self, _ip: &str, _port: u16) -> Arc<dyn AgentGateway> {
            self.0.clone()
        }
    }

    fn test_pod() -> Pod {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("app1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        podutil::set_pod_ips(&mut pod, "10.0.0.5");
        pod
    }

    fn deps_with_gateway(gateway: Arc<dyn AgentGateway>) -> MonitorDeps {
        let cache = Arc::new(PodCache::new());
        let pod = test_pod();
        cache.set(PodKey::from_pod(&pod), MetaPod::new(pod, None));

        MonitorDeps {
            cache,
            agents: Arc::new(AgentPool::new(Arc::new(StaticFactory(gateway)))),
            config: Arc::new(ProviderConfig::default()),
            notifier: NotifierCell::default(),
        }
    }

    /// Gateways whose streams never yield, so probe tasks block until
    /// cancelled.
    fn pending_gateway() -> Arc<dyn AgentGateway> {
        use crate::health::monitor::tests::ScriptedStream;

        let mut gateway = MockAgentGateway::new();
        gateway.expect_watch_application_health().returning(|| {
            Ok(Box::new(ScriptedStream {
                events: Default::default(),
            }) as Box<dyn crate::agent::WatchStream>)
        });
        gateway.expect_watch_health().returning(|| {
            Ok(Box::new(ScriptedStream {
                events: Default::default(),
            }) as Box<dyn crate::agent::WatchStream>)
        });
        gateway
            .expect_check_application_health()
            .returning(|| Ok(None));
        Arc::new(gateway)
    }

    #[tokio::test]
    async fn stop_returns_only_after_every_task_exits() {
        let deps = deps_with_gateway(pending_gateway());
        let monitor = PodMonitor::new(&test_pod(), &deps);

        assert_eq!(monitor.monitors().len(), 3);
        assert!(!monitor.is_monitoring());

        monitor.start().await;
        // let the probe tasks spin up and block
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(monitor.is_monitoring());

        monitor.stop().await;

        assert!(!monitor.is_monitoring());
        for child in monitor.monitors() {
            assert_eq!(child.state(), MonitoringState::Unknown);
            assert!(!child.is_monitoring());
        }
    }

    #[tokio::test]
    async fn start_twice_is_a_noop() {
        let deps = deps_with_gateway(pending_gateway());
        let monitor = PodMonitor::new(&test_pod(), &deps);

        monitor.start().await;
        monitor.start().await;

        // one handler + three monitors, not doubled
        assert_eq!(monitor.tasks.lock().await.len(), 4);

        monitor.stop().await;
    }
}
