//! Warm pool — pre-provisioned instances for fast pod starts.
//!
//! Ground truth for pool membership lives in provider tags, not in this
//! process: every managed instance carries `NodeName`, `ClusterName` and a
//! `Status` tag. The in-memory buckets are a cache rebuilt from those tags,
//! so a restarted adapter reconstructs its pool by listing instances.
//!
//! The four buckets share one async mutex. It is deliberately held across
//! tag writes: a bucket transition and its tag write must land together or
//! the next refresh would disagree with memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use rand::Rng;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::driver::{ComputeDriver, ComputeError, Filter, InstanceDescription, InstanceSpec, Tag};
use super::userdata::build_user_data;
use crate::config::{ProviderConfig, WarmPoolConfig};
use crate::metrics;
use crate::podutil;

/// Tag keys on every managed instance.
pub const TAG_NODE_NAME: &str = "NodeName";
pub const TAG_CLUSTER_NAME: &str = "ClusterName";
pub const TAG_STATUS: &str = "Status";
pub const TAG_POD_NAME: &str = "PodName";
pub const TAG_POD_NAMESPACE: &str = "PodNamespace";
pub const TAG_POD_UID: &str = "PodUID";

/// `Status` tag values.
pub const STATUS_PENDING_WARMPOOL: &str = "PENDING_WARMPOOL_PROVISIONING";
pub const STATUS_READY: &str = "Ready";
pub const STATUS_UNHEALTHY: &str = "Unhealthy";
pub const STATUS_PENDING_POD: &str = "PENDING_POD_PROVISIONING";
pub const STATUS_POD_IN_USE: &str = "POD_IN_USE";

const DEPTH_INTERVAL: Duration = Duration::from_secs(60);
const REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What the pool remembers about one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub instance_profile: String,
    pub security_groups: Vec<String>,
    pub retry_count: u32,
}

/// The four status buckets. An instance id lives in exactly one of them.
#[derive(Debug, Default)]
struct PoolState {
    ready: HashMap<String, InstanceInfo>,
    provisioning: HashMap<String, InstanceInfo>,
    unhealthy: HashMap<String, InstanceInfo>,
    allocated: HashMap<String, InstanceInfo>,
}

impl PoolState {
    fn warm_count(&self) -> usize {
        self.ready.len() + self.provisioning.len()
    }
}

pub struct WarmPoolManager {
    pools: Vec<WarmPoolConfig>,
    node_name: String,
    cluster_name: String,
    config: Arc<ProviderConfig>,
    driver: Arc<dyn ComputeDriver>,
    state: Mutex<PoolState>,
}

impl WarmPoolManager {
    pub fn new(
        config: Arc<ProviderConfig>,
        node_name: impl Into<String>,
        driver: Arc<dyn ComputeDriver>,
    ) -> Self {
        Self {
            pools: config.warm_pools.clone(),
            node_name: node_name.into(),
            cluster_name: config.cluster_name.clone(),
            config,
            driver,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn has_pools(&self) -> bool {
        !self.pools.is_empty()
    }

    /// Whether this pod may be served from a warm pool. Any configured pool
    /// grants blanket eligibility; per-pod selection is not implemented.
    pub fn pod_is_warm_pool(&self, _pod: &Pod) -> bool {
        self.has_pools()
    }

    /// Startup pass: import pre-existing tagged instances, then top every
    /// pool up to its desired count.
    pub async fn initial_fill(&self) {
        if !self.has_pools() {
            return;
        }

        info!("Initializing warm pool from existing tagged instances");
        self.refresh_from_tags().await;
        self.reconcile_depth().await;
    }

    /// Spawn the two maintenance loops. They run until the shutdown channel
    /// flips to true.
    pub fn spawn_loops(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if !self.has_pools() {
            return Vec::new();
        }

        let depth = {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(
                    "Starting warm pool depth reconciler (interval: {}s)",
                    DEPTH_INTERVAL.as_secs()
                );
                let mut interval = time::interval(DEPTH_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            debug!("Checking warm pool depth");
                            manager.reconcile_depth().await;
                        }
                        _ = shutdown.changed() => {
                            info!("Received shutdown signal, stopping depth reconciler");
                            break;
                        }
                    }
                }
            })
        };

        let refresh = {
            let manager = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(
                    "Starting warm pool state refresh (interval: {}m)",
                    REFRESH_INTERVAL.as_secs() / 60
                );
                let mut interval = time::interval(REFRESH_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                // the startup fill already classified once
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            debug!("Refreshing warm pool state from instance tags");
                            manager.refresh_from_tags().await;
                        }
                        _ = shutdown.changed() => {
                            info!("Received shutdown signal, stopping state refresh");
                            break;
                        }
                    }
                }
            })
        };

        vec![depth, refresh]
    }

    /// One depth pass over every pool config.
    pub async fn reconcile_depth(&self) {
        for pool in &self.pools {
            self.check_pool_depth(pool).await;
        }
    }

    async fn check_pool_depth(&self, pool: &WarmPoolConfig) {
        let mut state = self.state.lock().await;
        let warm = state.warm_count();

        if warm < pool.desired_count {
            let deficit = pool.desired_count - warm;
            info!(
                deficit,
                desired = pool.desired_count,
                "Warm pool below desired depth, creating instances"
            );
            for _ in 0..deficit {
                match self.create_warm(pool, &mut state).await {
                    Ok(()) => {}
                    Err(err @ ComputeError::Fatal(_)) => {
                        error!("Warm pool misconfigured, aborting this pass: {err}");
                        return;
                    }
                    Err(err) => {
                        warn!("Can't create warm pool instance: {err}");
                    }
                }
            }
        } else if warm > pool.desired_count {
            let excess = warm - pool.desired_count;
            info!(excess, "Terminating excess warm pool instances");
            for _ in 0..excess {
                // prefer Ready so in-flight provisioning is not wasted
                let victim = pop(&mut state.ready).or_else(|| pop(&mut state.provisioning));
                let Some(victim) = victim else {
                    warn!("Not enough instances to terminate, terminating as many as possible");
                    break;
                };
                match self.driver.terminate_instance(&victim.instance_id).await {
                    Ok(()) => metrics::WARM_EC2_TERMINATED.inc(),
                    Err(err) if err.is_not_found() => metrics::WARM_EC2_TERMINATED.inc(),
                    Err(err) => {
                        metrics::WARM_EC2_TERMINATION_ERRORS.inc();
                        warn!(
                            instance = victim.instance_id,
                            "Can't terminate warm pool instance: {err}"
                        );
                    }
                }
            }
        } else {
            debug!("Warm pool at desired depth, no action taken");
        }
    }

    /// Launch one instance for `pool` and file it under provisioning.
    async fn create_warm(
        &self,
        pool: &WarmPoolConfig,
        state: &mut MutexGuard<'_, PoolState>,
    ) -> Result<(), ComputeError> {
        if pool.subnets.is_empty() {
            return Err(ComputeError::Fatal(
                "1 or more Subnets must be configured for a warm pool".to_string(),
            ));
        }

        let user_data = build_user_data(self.driver.as_ref(), &self.config).await?;

        let subnet_idx = rand::rng().random_range(0..pool.subnets.len());
        let subnet = pool.subnets[subnet_idx].clone();
        debug!(
            subnet,
            available = pool.subnets.len(),
            "Randomly chose warm pool subnet"
        );

        let spec = InstanceSpec {
            image_id: pool.image_id.clone(),
            instance_type: pool.instance_type.clone(),
            instance_profile: pool.iam_instance_profile.clone(),
            key_pair: pool.key_pair.clone(),
            security_groups: pool.security_groups.clone(),
            subnet_id: subnet,
            user_data,
            tags: self.base_tags(STATUS_PENDING_WARMPOOL),
        };

        let instance_id = match self.driver.create_instance(&spec).await {
            Ok(id) => id,
            Err(err) => {
                metrics::WARM_EC2_LAUNCH_ERRORS.inc();
                return Err(err);
            }
        };
        metrics::WARM_EC2_LAUNCHED.inc();
        info!(instance = instance_id, "Created warm pool instance");

        state.provisioning.insert(
            instance_id.clone(),
            InstanceInfo {
                instance_id,
                private_ip: None,
                instance_profile: pool.iam_instance_profile.clone(),
                security_groups: pool.security_groups.clone(),
                retry_count: 0,
            },
        );

        Ok(())
    }

    /// Rebuild the four buckets from provider tags. This is the
    /// authoritative reconciliation: whatever the tags say wins. Instances
    /// found Running but still tagged PENDING are promoted to Ready.
    pub async fn refresh_from_tags(&self) {
        let mut state = self.state.lock().await;
        let mut fresh = PoolState::default();

        let filters = [
            Filter::new(
                format!("tag:{TAG_NODE_NAME}"),
                vec![self.node_name.clone()],
            ),
            Filter::new(
                format!("tag:{TAG_CLUSTER_NAME}"),
                vec![self.cluster_name.clone()],
            ),
            Filter::new(
                "instance-state-name",
                vec!["running".to_string(), "pending".to_string()],
            ),
        ];

        let mut next_token = None;
        loop {
            let page = match self.driver.describe_by_filter(&filters, next_token).await {
                Ok(page) => page,
                Err(err) => {
                    warn!("Unable to describe warm pool instances: {err}");
                    return;
                }
            };

            for instance in &page.instances {
                self.classify(instance, &mut fresh).await;
            }

            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        info!(
            ready = fresh.ready.len(),
            provisioning = fresh.provisioning.len(),
            unhealthy = fresh.unhealthy.len(),
            allocated = fresh.allocated.len(),
            "Warm pool refresh completed"
        );

        *state = fresh;
    }

    async fn classify(&self, instance: &InstanceDescription, fresh: &mut PoolState) {
        let info = InstanceInfo {
            instance_id: instance.instance_id.clone(),
            private_ip: instance.private_ip.clone(),
            ..Default::default()
        };

        match instance.tag_value(TAG_STATUS) {
            Some(STATUS_PENDING_WARMPOOL) => {
                if instance.state.is_running() {
                    // provisioning finished, promote in the source of truth
                    let tags = self.base_tags(STATUS_READY);
                    if let Err(err) =
                        self.driver.create_tags(&instance.instance_id, &tags).await
                    {
                        metrics::TAG_CREATION_ERRORS.inc();
                        warn!(
                            instance = instance.instance_id,
                            "Unable to transition instance from Provisioning to Ready: {err}"
                        );
                        fresh.provisioning.insert(instance.instance_id.clone(), info);
                    } else {
                        fresh.ready.insert(instance.instance_id.clone(), info);
                    }
                } else {
                    fresh.provisioning.insert(instance.instance_id.clone(), info);
                }
            }
            Some(STATUS_READY) => {
                fresh.ready.insert(instance.instance_id.clone(), info);
            }
            Some(STATUS_UNHEALTHY) => {
                fresh.unhealthy.insert(instance.instance_id.clone(), info);
            }
            Some(STATUS_PENDING_POD) | Some(STATUS_POD_IN_USE) => {
                fresh.allocated.insert(instance.instance_id.clone(), info);
            }
            other => {
                debug!(
                    instance = instance.instance_id,
                    status = other.unwrap_or("<missing>"),
                    "Ignoring instance with unrecognized status tag"
                );
            }
        }
    }

    /// Take one Ready instance for `pod`, if any. The classification is
    /// recomputed from tags first so a stale bucket can't hand out a dead
    /// instance. On success the instance's status tag is already rewritten
    /// to `PENDING_POD_PROVISIONING` with the pod identity attached.
    pub async fn try_allocate(
        &self,
        pod: &Pod,
    ) -> Result<Option<(String, String)>, ComputeError> {
        debug!("Checking for available warm pool instance");
        self.refresh_from_tags().await;

        let mut state = self.state.lock().await;

        let Some(info) = pop(&mut state.ready) else {
            return Ok(None);
        };

        let tags = self.pod_tags(STATUS_PENDING_POD, pod);
        if let Err(err) = self.driver.create_tags(&info.instance_id, &tags).await {
            metrics::TAG_CREATION_ERRORS.inc();
            error!(
                instance = info.instance_id,
                pod = podutil::pod_name(pod),
                "Can't update tags for allocated warm pool instance: {err}"
            );
            return Err(err);
        }

        let instance_id = info.instance_id.clone();
        let private_ip = info.private_ip.clone().unwrap_or_default();
        state.allocated.insert(instance_id.clone(), info);

        Ok(Some((instance_id, private_ip)))
    }

    /// Mark an allocated instance as carrying a launched pod.
    pub async fn tag_in_use(&self, instance_id: &str, pod: &Pod) -> Result<(), ComputeError> {
        let _state = self.state.lock().await;

        let tags = self.pod_tags(STATUS_POD_IN_USE, pod);
        self.driver
            .create_tags(instance_id, &tags)
            .await
            .inspect_err(|_| metrics::TAG_CREATION_ERRORS.inc())
    }

    fn base_tags(&self, status: &str) -> Vec<Tag> {
        vec![
            Tag::new(TAG_NODE_NAME, self.node_name.clone()),
            Tag::new(TAG_CLUSTER_NAME, self.cluster_name.clone()),
            Tag::new(TAG_STATUS, status),
        ]
    }

    fn pod_tags(&self, status: &str, pod: &Pod) -> Vec<Tag> {
        let mut tags = self.base_tags(status);
        tags.push(Tag::new(TAG_POD_NAME, podutil::pod_name(pod)));
        tags.push(Tag::new(TAG_POD_NAMESPACE, podutil::pod_namespace(pod)));
        tags.push(Tag::new(TAG_POD_UID, podutil::pod_uid(pod)));
        tags
    }

    #[cfg(test)]
    async fn bucket_sizes(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock().await;
        (
            state.ready.len(),
            state.provisioning.len(),
            state.unhealthy.len(),
            state.allocated.len(),
        )
    }

    #[cfg(test)]
    async fn ready_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.ready.keys().cloned().collect()
    }
}

/// Remove an arbitrary entry. Selection order is unspecified.
fn pop(bucket: &mut HashMap<String, InstanceInfo>) -> Option<InstanceInfo> {
    let key = bucket.keys().next()?.clone();
    bucket.remove(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::fake::{FakeCompute, FakeInstance};
    use crate::compute::driver::InstanceState;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_config(desired_count: usize) -> Arc<ProviderConfig> {
        let mut cfg = ProviderConfig::default();
        cfg.region = "us-west-2".to_string();
        cfg.cluster_name = "test-cluster".to_string();
        cfg.management_subnet = "subnet-mgmt".to_string();
        cfg.warm_pools.push(WarmPoolConfig {
            desired_count,
            image_id: "ami-0001".to_string(),
            instance_type: "t3.small".to_string(),
            subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
            ..Default::default()
        });
        Arc::new(cfg)
    }

    fn warm_tags(status: &str) -> Vec<Tag> {
        vec![
            Tag::new(TAG_NODE_NAME, "node-1"),
            Tag::new(TAG_CLUSTER_NAME, "test-cluster"),
            Tag::new(TAG_STATUS, status),
        ]
    }

    fn test_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("app1".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1234".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn manager(desired_count: usize, driver: Arc<FakeCompute>) -> WarmPoolManager {
        WarmPoolManager::new(test_config(desired_count), "node-1", driver)
    }

    #[tokio::test]
    async fn depth_reconcile_fills_to_desired_and_is_idempotent() {
        let driver = Arc::new(FakeCompute::new());
        let mgr = manager(3, driver.clone());

        mgr.reconcile_depth().await;
        let (ready, provisioning, _, _) = mgr.bucket_sizes().await;
        assert_eq!(ready + provisioning, 3);
        assert_eq!(driver.instance_count().await, 3);

        // a second pass with no external changes creates nothing
        mgr.reconcile_depth().await;
        assert_eq!(driver.instance_count().await, 3);

        // every created instance carries the initial PENDING tag
        for launch in driver.launches().await {
            assert!(launch
                .tags
                .iter()
                .any(|t| t.key == TAG_STATUS && t.value == STATUS_PENDING_WARMPOOL));
            assert!(launch.subnet_id == "subnet-a" || launch.subnet_id == "subnet-b");
        }
    }

    #[tokio::test]
    async fn refresh_classifies_and_promotes_running_pending() {
        let driver = Arc::new(FakeCompute::new());
        driver
            .add_instance(FakeInstance {
                instance_id: "i-pending".to_string(),
                state: InstanceState::Pending,
                private_ip: Some("10.0.0.1".to_string()),
                tags: warm_tags(STATUS_PENDING_WARMPOOL),
            })
            .await;
        driver
            .add_instance(FakeInstance {
                instance_id: "i-promote".to_string(),
                state: InstanceState::Running,
                private_ip: Some("10.0.0.2".to_string()),
                tags: warm_tags(STATUS_PENDING_WARMPOOL),
            })
            .await;
        driver
            .add_instance(FakeInstance {
                instance_id: "i-used".to_string(),
                state: InstanceState::Running,
                private_ip: Some("10.0.0.3".to_string()),
                tags: warm_tags(STATUS_POD_IN_USE),
            })
            .await;
        driver
            .add_instance(FakeInstance {
                instance_id: "i-other-node".to_string(),
                state: InstanceState::Running,
                private_ip: Some("10.0.0.4".to_string()),
                tags: vec![
                    Tag::new(TAG_NODE_NAME, "node-2"),
                    Tag::new(TAG_CLUSTER_NAME, "test-cluster"),
                    Tag::new(TAG_STATUS, STATUS_READY),
                ],
            })
            .await;

        let mgr = manager(2, driver.clone());
        mgr.refresh_from_tags().await;

        let (ready, provisioning, unhealthy, allocated) = mgr.bucket_sizes().await;
        assert_eq!(ready, 1, "running PENDING instance promoted to Ready");
        assert_eq!(provisioning, 1);
        assert_eq!(unhealthy, 0);
        assert_eq!(allocated, 1);
        assert_eq!(mgr.ready_ids().await, vec!["i-promote".to_string()]);

        // promotion rewrote the source-of-truth tag
        let promoted = driver.instance("i-promote").await.unwrap();
        assert!(promoted
            .tags
            .iter()
            .any(|t| t.key == TAG_STATUS && t.value == STATUS_READY));
    }

    #[tokio::test]
    async fn try_allocate_pops_ready_and_retags() {
        let driver = Arc::new(FakeCompute::new());
        driver
            .add_instance(FakeInstance {
                instance_id: "i-aa".to_string(),
                state: InstanceState::Running,
                private_ip: Some("10.0.0.10".to_string()),
                tags: warm_tags(STATUS_READY),
            })
            .await;

        let mgr = manager(2, driver.clone());
        let allocated = mgr.try_allocate(&test_pod()).await.unwrap();

        let (instance_id, private_ip) = allocated.expect("an instance should be available");
        assert_eq!(instance_id, "i-aa");
        assert_eq!(private_ip, "10.0.0.10");
        assert!(mgr.ready_ids().await.is_empty());

        let tagged = driver.instance("i-aa").await.unwrap();
        assert!(tagged
            .tags
            .iter()
            .any(|t| t.key == TAG_STATUS && t.value == STATUS_PENDING_POD));
        assert!(tagged
            .tags
            .iter()
            .any(|t| t.key == TAG_POD_UID && t.value == "uid-1234"));
    }

    #[tokio::test]
    async fn try_allocate_with_empty_pool_returns_none() {
        let driver = Arc::new(FakeCompute::new());
        let mgr = manager(2, driver);

        assert!(mgr.try_allocate(&test_pod()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn excess_instances_terminated_ready_first() {
        let driver = Arc::new(FakeCompute::new());
        for (id, status) in [
            ("i-r1", STATUS_READY),
            ("i-r2", STATUS_READY),
            ("i-p1", STATUS_PENDING_WARMPOOL),
        ] {
            driver
                .add_instance(FakeInstance {
                    instance_id: id.to_string(),
                    state: if status == STATUS_READY {
                        InstanceState::Running
                    } else {
                        InstanceState::Pending
                    },
                    private_ip: Some("10.0.0.9".to_string()),
                    tags: warm_tags(status),
                })
                .await;
        }

        let mgr = manager(1, driver.clone());
        mgr.refresh_from_tags().await;
        mgr.reconcile_depth().await;

        let (ready, provisioning, _, _) = mgr.bucket_sizes().await;
        assert_eq!(ready + provisioning, 1);
        assert_eq!(driver.instance_count().await, 1);
        // the provisioning instance survives; Ready ones were preferred
        assert!(driver.instance("i-p1").await.is_some());
    }

    #[tokio::test]
    async fn create_warm_without_subnets_is_fatal() {
        let driver = Arc::new(FakeCompute::new());
        let mut cfg = ProviderConfig::default();
        cfg.cluster_name = "test-cluster".to_string();
        let pool = WarmPoolConfig {
            desired_count: 1,
            image_id: "ami-0001".to_string(),
            instance_type: "t3.small".to_string(),
            subnets: vec![],
            ..Default::default()
        };
        cfg.warm_pools.push(pool.clone());
        let mgr = WarmPoolManager::new(Arc::new(cfg), "node-1", driver.clone());

        let mut state = mgr.state.lock().await;
        let err = mgr.create_warm(&pool, &mut state).await.unwrap_err();
        assert!(matches!(err, ComputeError::Fatal(_)));
        drop(state);

        assert_eq!(driver.instance_count().await, 0);
    }
}
