//! Compute driver — abstract interface over the cloud compute API.
//!
//! Everything the adapter needs from the cloud: run an instance, terminate
//! it, describe it, tag it, list by tag filters, presign the bootstrap
//! artifact. `fake.rs` provides the in-memory implementation used by tests
//! and the demo binary; a production deployment injects an SDK-backed one.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ComputeError>;

/// Errors are bucketed by how callers should react: `NotFound` makes deletes
/// idempotent, `Transient` is worth retrying, `Fatal` is surfaced as-is.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("transient compute error: {0}")]
    Transient(String),

    #[error("fatal compute error: {0}")]
    Fatal(String),
}

impl ComputeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ComputeError::Transient(_))
    }
}

/// Lifecycle state of a cloud instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn is_running(self) -> bool {
        self == InstanceState::Running
    }
}

/// One key/value label on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceSpec {
    pub image_id: String,
    pub instance_type: String,
    pub instance_profile: String,
    pub key_pair: String,
    pub security_groups: Vec<String>,
    pub subnet_id: String,
    /// Base64 user data handed to the instance on boot.
    pub user_data: String,
    pub tags: Vec<Tag>,
}

/// Snapshot of one instance as the provider reports it.
#[derive(Debug, Clone)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub tags: Vec<Tag>,
}

impl InstanceDescription {
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }

    /// Tags as a map, for callers comparing several keys at once.
    pub fn tag_map(&self) -> BTreeMap<&str, &str> {
        self.tags
            .iter()
            .map(|tag| (tag.key.as_str(), tag.value.as_str()))
            .collect()
    }
}

/// A tag or attribute filter for `describe_by_filter`. `tag:<Key>` selects
/// on tag values, matching the provider's filter grammar.
#[derive(Debug, Clone)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new(name: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// One page of a filtered instance listing.
#[derive(Debug, Clone, Default)]
pub struct InstancePage {
    pub instances: Vec<InstanceDescription>,
    pub next_token: Option<String>,
}

/// Async interface over the cloud compute API. Implementations must be
/// `Send + Sync`; the adapter shares one driver across every subsystem.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    /// Launch one instance, returning its id.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String>;

    /// Terminate an instance. Implementations report an already-gone
    /// instance as `NotFound`; callers on delete paths treat that as
    /// success.
    async fn terminate_instance(&self, instance_id: &str) -> Result<()>;

    /// Current state and addressing of one instance.
    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceDescription>;

    /// Block until the instance reaches Running, or fail after `timeout`.
    async fn wait_until_running(&self, instance_id: &str, timeout: Duration) -> Result<()>;

    /// Create or overwrite tags on an instance.
    async fn create_tags(&self, instance_id: &str, tags: &[Tag]) -> Result<()>;

    /// One page of instances matching every filter. Pass the previous
    /// page's `next_token` to continue.
    async fn describe_by_filter(
        &self,
        filters: &[Filter],
        next_token: Option<String>,
    ) -> Result<InstancePage>;

    /// Presigned download URL for an object-store artifact.
    async fn presign_artifact_url(&self, bucket: &str, key: &str) -> Result<String>;
}
