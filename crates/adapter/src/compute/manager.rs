//! Compute manager: binds pods to instances.
//!
//! `get_compute` tries, in order: the instance already annotated on the pod
//! (if it is still running), a warm pool allocation, a fresh launch built
//! from the pod's annotations. `delete_compute` terminates unconditionally —
//! warm-pool-sourced instances are not returned to the pool.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, warn};

use super::driver::{ComputeDriver, ComputeError, InstanceSpec, Result, Tag};
use super::userdata::build_user_data;
use super::warmpool::WarmPoolManager;
use crate::config::ProviderConfig;
use crate::metrics;
use crate::podutil;

/// Bound on the wait for a freshly launched instance to reach Running.
const RUNNING_WAIT: Duration = Duration::from_secs(300);

/// Where a pod's instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeSource {
    /// The pod already had a live instance bound.
    Existing,
    /// Allocated from a warm pool.
    WarmPool,
    /// Launched fresh for this pod.
    Created,
}

/// A pod's compute binding.
#[derive(Debug, Clone)]
pub struct ComputeBinding {
    pub instance_id: String,
    pub private_ip: String,
    pub source: ComputeSource,
}

pub struct ComputeManager {
    driver: Arc<dyn ComputeDriver>,
    config: Arc<ProviderConfig>,
}

impl ComputeManager {
    pub fn new(driver: Arc<dyn ComputeDriver>, config: Arc<ProviderConfig>) -> Self {
        Self { driver, config }
    }

    /// Obtain compute for the pod. On success the pod carries the
    /// `instance-id` annotation for the returned instance.
    pub async fn get_compute(
        &self,
        warm_pool: &WarmPoolManager,
        pod: &mut Pod,
    ) -> Result<ComputeBinding> {
        if let Some((instance_id, private_ip)) = self.existing_instance(pod).await {
            info!(
                pod = podutil::pod_name(pod),
                instance = instance_id,
                "Pod already assigned to a running instance (reusing compute)"
            );
            return Ok(ComputeBinding {
                instance_id,
                private_ip,
                source: ComputeSource::Existing,
            });
        }

        if warm_pool.pod_is_warm_pool(pod) {
            info!(
                pod = podutil::pod_name(pod),
                "Pod is configured for warm pool"
            );

            match warm_pool.try_allocate(pod).await? {
                Some((instance_id, private_ip)) => {
                    podutil::set_annotation(pod, podutil::ANNOTATION_INSTANCE_ID, &instance_id);
                    return Ok(ComputeBinding {
                        instance_id,
                        private_ip,
                        source: ComputeSource::WarmPool,
                    });
                }
                None => {
                    warn!(
                        pod = podutil::pod_name(pod),
                        "Pod is configured to use warm pool, but no instance was available"
                    );
                    return Err(ComputeError::Transient(
                        "no instance in 'Ready' state".to_string(),
                    ));
                }
            }
        }

        self.create_compute(pod).await
    }

    /// The instance already annotated on the pod, if it is still running.
    /// Any describe failure means the binding is stale and a new instance
    /// is needed.
    async fn existing_instance(&self, pod: &Pod) -> Option<(String, String)> {
        let instance_id = podutil::annotation(pod, podutil::ANNOTATION_INSTANCE_ID)?;

        let description = match self.driver.describe_instance(instance_id).await {
            Ok(description) => description,
            Err(err) => {
                debug!(
                    instance = instance_id,
                    "Annotated instance can't be described, replacing: {err}"
                );
                return None;
            }
        };

        if !description.state.is_running() {
            return None;
        }

        let private_ip = description
            .private_ip
            .or_else(|| podutil::pod_ip(pod).map(str::to_string))?;

        Some((instance_id.to_string(), private_ip))
    }

    /// Launch a fresh instance from the pod's annotations.
    async fn create_compute(&self, pod: &mut Pod) -> Result<ComputeBinding> {
        info!(pod = podutil::pod_name(pod), "Generating a fresh instance");

        let user_data = build_user_data(self.driver.as_ref(), &self.config).await?;

        let spec = self.launch_spec(pod, user_data);
        let instance_id = match self.driver.create_instance(&spec).await {
            Ok(instance_id) => instance_id,
            Err(err) => {
                metrics::EC2_LAUNCH_ERRORS.inc();
                return Err(err);
            }
        };
        metrics::EC2_LAUNCHED.inc();
        info!(instance = instance_id, "Launched an instance");

        podutil::set_annotation(pod, podutil::ANNOTATION_INSTANCE_ID, &instance_id);

        self.driver
            .wait_until_running(&instance_id, RUNNING_WAIT)
            .await?;

        let description = self.driver.describe_instance(&instance_id).await?;
        let private_ip = description.private_ip.ok_or_else(|| {
            ComputeError::Transient(format!("instance {instance_id} has no private ip yet"))
        })?;

        Ok(ComputeBinding {
            instance_id,
            private_ip,
            source: ComputeSource::Created,
        })
    }

    fn launch_spec(&self, pod: &Pod, user_data: String) -> InstanceSpec {
        let image_id = podutil::annotation(pod, podutil::ANNOTATION_IMAGE_ID)
            .unwrap_or(&self.config.vm_config.default_ami)
            .to_string();

        let security_groups = podutil::annotation(pod, podutil::ANNOTATION_SECURITY_GROUPS)
            .map(|groups| podutil::trimmed_split(groups, ','))
            .unwrap_or_default();

        // free-form tags ride in one JSON-object annotation
        let tags: Vec<Tag> = podutil::annotation(pod, podutil::ANNOTATION_TAGS)
            .and_then(|raw| serde_json::from_str::<BTreeMap<String, String>>(raw).ok())
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| Tag::new(key.trim(), value.trim()))
            .collect();

        InstanceSpec {
            image_id,
            instance_type: podutil::annotation(pod, podutil::ANNOTATION_INSTANCE_TYPE)
                .unwrap_or_default()
                .to_string(),
            instance_profile: podutil::annotation(pod, podutil::ANNOTATION_INSTANCE_PROFILE)
                .unwrap_or_default()
                .to_string(),
            key_pair: podutil::annotation(pod, podutil::ANNOTATION_KEY_PAIR)
                .unwrap_or_default()
                .to_string(),
            security_groups,
            subnet_id: podutil::annotation(pod, podutil::ANNOTATION_SUBNET_ID)
                .unwrap_or_default()
                .to_string(),
            user_data,
            tags,
        }
    }

    /// Terminate the pod's instance. An instance that is already gone (or a
    /// pod that never got one) counts as success.
    pub async fn delete_compute(&self, pod: &Pod) -> Result<()> {
        let Some(instance_id) = podutil::annotation(pod, podutil::ANNOTATION_INSTANCE_ID) else {
            debug!(
                pod = podutil::pod_name(pod),
                "No instance bound to pod, nothing to terminate"
            );
            return Ok(());
        };

        match self.driver.terminate_instance(instance_id).await {
            Ok(()) => {
                metrics::EC2_TERMINATED.inc();
                info!(instance = instance_id, "Terminated instance");
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                debug!(
                    instance = instance_id,
                    "Instance already gone, treating termination as success"
                );
                Ok(())
            }
            Err(err) => {
                metrics::EC2_TERMINATION_ERRORS.inc();
                Err(err)
            }
        }
    }
}
