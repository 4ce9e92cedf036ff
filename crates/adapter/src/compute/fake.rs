//! Fake — in-memory compute driver.
//!
//! Implements [`ComputeDriver`] against an in-memory instance table. Tests
//! seed and script it; the demo binary wires it so the whole adapter can run
//! without cloud credentials. Launch specs and tag writes are recorded for
//! assertions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::driver::{
    ComputeDriver, ComputeError, Filter, InstanceDescription, InstancePage, InstanceSpec,
    InstanceState, Result, Tag,
};

/// A canned instance in the fake table.
#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub tags: Vec<Tag>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, FakeInstance>,
    launches: Vec<InstanceSpec>,
    tag_writes: Vec<(String, Vec<Tag>)>,
    next_ids: VecDeque<(String, String)>,
    fail_next_create: Option<ComputeError>,
    counter: u32,
}

/// A fake compute driver for deterministic testing.
pub struct FakeCompute {
    inner: Mutex<Inner>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Seed an instance into the table.
    pub async fn add_instance(&self, instance: FakeInstance) {
        let mut state = self.inner.lock().await;
        state
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    /// Script the (id, ip) the next `create_instance` calls will hand out,
    /// in order. Unscripted calls fall back to generated values.
    pub async fn script_next_instance(&self, instance_id: &str, private_ip: &str) {
        self.inner
            .lock()
            .await
            .next_ids
            .push_back((instance_id.to_string(), private_ip.to_string()));
    }

    /// Make the next `create_instance` call fail with `err`.
    pub async fn fail_next_create(&self, err: ComputeError) {
        self.inner.lock().await.fail_next_create = Some(err);
    }

    /// Every launch spec `create_instance` has received.
    pub async fn launches(&self) -> Vec<InstanceSpec> {
        self.inner.lock().await.launches.clone()
    }

    /// Every tag write, in order.
    pub async fn tag_writes(&self) -> Vec<(String, Vec<Tag>)> {
        self.inner.lock().await.tag_writes.clone()
    }

    pub async fn instance(&self, instance_id: &str) -> Option<FakeInstance> {
        self.inner.lock().await.instances.get(instance_id).cloned()
    }

    pub async fn instance_count(&self) -> usize {
        self.inner.lock().await.instances.len()
    }

    fn state_name(state: InstanceState) -> &'static str {
        match state {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
        }
    }

    fn matches(instance: &FakeInstance, filters: &[Filter]) -> bool {
        filters.iter().all(|filter| {
            if let Some(tag_key) = filter.name.strip_prefix("tag:") {
                instance
                    .tags
                    .iter()
                    .any(|tag| tag.key == tag_key && filter.values.contains(&tag.value))
            } else if filter.name == "instance-state-name" {
                filter
                    .values
                    .iter()
                    .any(|v| v == Self::state_name(instance.state))
            } else {
                false
            }
        })
    }
}

impl Default for FakeCompute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeDriver for FakeCompute {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String> {
        let mut state = self.inner.lock().await;

        if let Some(err) = state.fail_next_create.take() {
            return Err(err);
        }

        state.launches.push(spec.clone());

        let (instance_id, private_ip) = state.next_ids.pop_front().unwrap_or_else(|| {
            state.counter += 1;
            (
                format!("i-{:08x}", state.counter),
                format!("10.0.0.{}", state.counter),
            )
        });

        state.instances.insert(
            instance_id.clone(),
            FakeInstance {
                instance_id: instance_id.clone(),
                state: InstanceState::Pending,
                private_ip: Some(private_ip),
                tags: spec.tags.clone(),
            },
        );

        Ok(instance_id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        match state.instances.remove(instance_id) {
            Some(_) => Ok(()),
            None => Err(ComputeError::NotFound(instance_id.to_string())),
        }
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription> {
        let state = self.inner.lock().await;
        let instance = state
            .instances
            .get(instance_id)
            .ok_or_else(|| ComputeError::NotFound(instance_id.to_string()))?;

        Ok(InstanceDescription {
            instance_id: instance.instance_id.clone(),
            state: instance.state,
            private_ip: instance.private_ip.clone(),
            tags: instance.tags.clone(),
        })
    }

    async fn wait_until_running(&self, instance_id: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.inner.lock().await;
        match state.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.state = InstanceState::Running;
                Ok(())
            }
            None => Err(ComputeError::NotFound(instance_id.to_string())),
        }
    }

    async fn create_tags(&self, instance_id: &str, tags: &[Tag]) -> Result<()> {
        let mut state = self.inner.lock().await;
        state
            .tag_writes
            .push((instance_id.to_string(), tags.to_vec()));

        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| ComputeError::NotFound(instance_id.to_string()))?;

        for tag in tags {
            match instance.tags.iter_mut().find(|t| t.key == tag.key) {
                Some(existing) => existing.value = tag.value.clone(),
                None => instance.tags.push(tag.clone()),
            }
        }

        Ok(())
    }

    async fn describe_by_filter(
        &self,
        filters: &[Filter],
        _next_token: Option<String>,
    ) -> Result<InstancePage> {
        let state = self.inner.lock().await;

        let mut instances: Vec<InstanceDescription> = state
            .instances
            .values()
            .filter(|instance| Self::matches(instance, filters))
            .map(|instance| InstanceDescription {
                instance_id: instance.instance_id.clone(),
                state: instance.state,
                private_ip: instance.private_ip.clone(),
                tags: instance.tags.clone(),
            })
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        Ok(InstancePage {
            instances,
            next_token: None,
        })
    }

    async fn presign_artifact_url(&self, bucket: &str, key: &str) -> Result<String> {
        Ok(format!(
            "https://{bucket}.object-store.invalid/{key}?signature=fake"
        ))
    }
}
