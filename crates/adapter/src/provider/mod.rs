//! Provider facade: the pod-lifecycle contract the orchestrator drives.
//!
//! The orchestrator's pod controller calls these entry points on its own
//! worker pool; they return plain errors so its retry/backoff governs
//! re-invocation. `CreatePod` is never retried here — a failure after
//! compute acquisition triggers compensating cleanup instead.

pub mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::agent::{AgentError, AgentPool};
use crate::compute::{
    ComputeDriver, ComputeError, ComputeManager, ComputeSource, WarmPoolManager,
};
use crate::config::ProviderConfig;
use crate::health::{MonitorDeps, PodMonitor};
use crate::metrics;
use crate::podutil;
use cache::{CacheError, MetaPod, PodCache, PodKey};

/// Callback that publishes an updated pod back into the orchestrator.
pub type Notifier = Arc<dyn Fn(Pod) + Send + Sync>;

/// Shared slot for the orchestrator notifier. Registered once when the
/// orchestrator attaches; every reader tolerates it being unset until then.
#[derive(Clone, Default)]
pub struct NotifierCell {
    inner: Arc<RwLock<Option<Notifier>>>,
}

impl NotifierCell {
    pub fn set(&self, notifier: Notifier) {
        *self.inner.write() = Some(notifier);
    }

    /// Invoke the notifier if registered. The lock is released before the
    /// callback runs. Returns false when no notifier is set.
    pub fn notify(&self, pod: Pod) -> bool {
        let notifier = self.inner.read().clone();
        match notifier {
            Some(notifier) => {
                notifier(pod);
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.read().is_some()
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("pod {name}({namespace}) does not exist")]
    PodNotFound { namespace: String, name: String },

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl ProviderError {
    fn not_found(key: &PodKey) -> Self {
        Self::PodNotFound {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::PodNotFound { .. })
    }
}

impl From<CacheError> for ProviderError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(key) => ProviderError::not_found(&key),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// The lifecycle entry points the orchestrator invokes against this node.
#[async_trait]
pub trait PodLifecycle: Send + Sync {
    async fn create_pod(&self, pod: Pod) -> Result<()>;

    async fn update_pod(&self, pod: Pod) -> Result<()>;

    async fn delete_pod(&self, pod: &Pod) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus>;

    async fn get_pods(&self) -> Result<Vec<Pod>>;
}

/// Projects externally-hosted VMs into the cluster as pods on one node.
pub struct VmProvider {
    config: Arc<ProviderConfig>,
    pods: Arc<PodCache>,
    compute: ComputeManager,
    warm_pool: Arc<WarmPoolManager>,
    agents: Arc<AgentPool>,
    notifier: NotifierCell,
}

impl VmProvider {
    /// Build a provider over a (possibly pre-seeded) pod cache. Call
    /// [`VmProvider::populate_cache`] afterwards to create monitors for
    /// seeded entries.
    pub fn new(
        config: Arc<ProviderConfig>,
        node_name: impl Into<String>,
        driver: Arc<dyn ComputeDriver>,
        agents: Arc<AgentPool>,
        seeded: PodCache,
    ) -> Self {
        let node_name = node_name.into();
        Self {
            compute: ComputeManager::new(driver.clone(), config.clone()),
            warm_pool: Arc::new(WarmPoolManager::new(config.clone(), node_name, driver)),
            pods: Arc::new(seeded),
            agents,
            notifier: NotifierCell::default(),
            config,
        }
    }

    /// Register the orchestrator's status callback.
    pub fn notify_pods(&self, notifier: Notifier) {
        info!("Pod notifier callback registered");
        self.notifier.set(notifier);
    }

    pub fn warm_pool(&self) -> &Arc<WarmPoolManager> {
        &self.warm_pool
    }

    pub fn cache(&self) -> &Arc<PodCache> {
        &self.pods
    }

    fn agent_port(&self) -> u16 {
        self.config.agent_connection.port
    }

    fn monitor_deps(&self) -> MonitorDeps {
        MonitorDeps {
            cache: self.pods.clone(),
            agents: self.agents.clone(),
            config: self.config.clone(),
            notifier: self.notifier.clone(),
        }
    }

    /// Create and start monitors for every cache entry that has none.
    /// Run once at startup, after the cache was seeded from the
    /// orchestrator's pod list.
    pub async fn populate_cache(&self) {
        let entries = self.pods.get_list();
        info!(
            pods = entries.len(),
            "Populating cache: creating monitors for rehydrated pods"
        );

        for entry in entries {
            if entry.monitor.is_some() {
                continue;
            }
            let key = PodKey::from_pod(&entry.pod);
            info!(pod = %key, "Recreating pod monitor (populated from cache)");

            let monitor = Arc::new(PodMonitor::new(&entry.pod, &self.monitor_deps()));
            monitor.start().await;
            self.pods.set(key, MetaPod::new(entry.pod, Some(monitor)));
        }
    }

    /// Stop every pod monitor. Used during process shutdown.
    pub async fn stop_all_monitors(&self) {
        for entry in self.pods.get_list() {
            if let Some(monitor) = entry.monitor {
                monitor.stop().await;
            }
        }
    }
}

#[async_trait]
impl PodLifecycle for VmProvider {
    async fn create_pod(&self, mut pod: Pod) -> Result<()> {
        let key = PodKey::from_pod(&pod);
        info!(pod = %key, "Received CreatePod request");

        // create (but don't start) the pod monitor, and cache the pod
        let monitor = Arc::new(PodMonitor::new(&pod, &self.monitor_deps()));
        self.pods
            .set(key.clone(), MetaPod::new(pod.clone(), Some(monitor.clone())));

        let binding = match self.compute.get_compute(&self.warm_pool, &mut pod).await {
            Ok(binding) => binding,
            Err(err) => {
                error!(pod = %key, "Error getting compute for pod: {err}");
                return Err(err.into());
            }
        };

        podutil::set_pod_ips(&mut pod, &binding.private_ip);

        // launch the application on the VM; a failure here must unwind the
        // compute we just acquired
        let gateway = self
            .agents
            .gateway_for(&binding.private_ip, self.agent_port());
        if let Err(err) = gateway.launch_application(&pod).await {
            error!(pod = %key, "Error launching application: {err}");

            if let Err(cleanup_err) = self.compute.delete_compute(&pod).await {
                error!(
                    pod = %key,
                    "Error deleting compute while cleaning up failed CreatePod: {cleanup_err}"
                );
            }
            self.agents.evict(&binding.private_ip, self.agent_port());
            self.pods.delete(&key);

            return Err(err.into());
        }

        if binding.source == ComputeSource::WarmPool {
            self.warm_pool
                .tag_in_use(&binding.instance_id, &pod)
                .await?;
        }

        if let Err(err) = self.pods.update_pod(&key, pod.clone()) {
            warn!(pod = %key, "Can't write realized pod back to cache: {err}");
        }

        monitor.start().await;

        if !self.notifier.notify(pod) {
            info!(pod = %key, "Unable to notify pod creation (notifier not set)");
        }
        metrics::PODS_CREATED.inc();

        Ok(())
    }

    async fn update_pod(&self, pod: Pod) -> Result<()> {
        let key = PodKey::from_pod(&pod);
        info!(pod = %key, "Received UpdatePod request");

        self.pods.update_pod(&key, pod)?;
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let key = PodKey::from_pod(pod);
        info!(pod = %key, "Received DeletePod request");

        let meta = self.pods.get(&key);

        // stop monitoring before tearing the VM down
        match meta.as_ref().and_then(|m| m.monitor.clone()) {
            Some(monitor) => monitor.stop().await,
            None => warn!(pod = %key, "No monitor attached to pod, skipping monitor stop"),
        }

        // best-effort application stop; deletion proceeds on failure
        let ip = meta
            .as_ref()
            .and_then(|m| podutil::pod_ip(&m.pod))
            .or_else(|| podutil::pod_ip(pod))
            .map(str::to_string);
        match ip {
            Some(ip) => {
                let gateway = self.agents.gateway_for(&ip, self.agent_port());
                if let Err(err) = gateway.terminate_application().await {
                    warn!(pod = %key, "Could not terminate application, continuing delete: {err}");
                }
                self.agents.evict(&ip, self.agent_port());
            }
            None => warn!(pod = %key, "Pod has no ip, skipping application termination"),
        }

        self.compute.delete_compute(pod).await?;

        let mut final_pod = pod.clone();
        podutil::mark_pod_deleted(&mut final_pod);
        if !self.notifier.notify(final_pod) {
            info!(pod = %key, "Unable to notify pod deletion (notifier not set)");
        }

        self.pods.delete(&key);
        metrics::PODS_DELETED.inc();
        info!(pod = %key, "Pod deleted");

        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let key = PodKey::new(namespace, name);
        match self.pods.get(&key) {
            Some(meta) => Ok(meta.pod),
            None => Err(ProviderError::not_found(&key)),
        }
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> Result<PodStatus> {
        let key = PodKey::new(namespace, name);
        match self.pods.get(&key) {
            Some(meta) => Ok(meta.pod.status.clone().unwrap_or_default()),
            None => Err(ProviderError::not_found(&key)),
        }
    }

    async fn get_pods(&self) -> Result<Vec<Pod>> {
        let pods = self.pods.get_pod_list();
        info!(pods = pods.len(), "Received GetPods request");
        Ok(pods)
    }
}
