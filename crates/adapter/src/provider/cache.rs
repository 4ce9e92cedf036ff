//! Pod cache: the adapter's mirror of orchestrator state.
//!
//! Keyed by (namespace, name). Values pair the pod with its monitor handle.
//! One reader/writer lock guards the map; list operations hand back owned
//! snapshots so no caller ever iterates under the lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::health::PodMonitor;
use crate::podutil;

/// Composite cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self::new(podutil::pod_namespace(pod), podutil::pod_name(pod))
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A cached pod and its monitor handle. Rehydrated entries start without a
/// monitor; the facade creates and starts one.
#[derive(Clone)]
pub struct MetaPod {
    pub pod: Pod,
    pub monitor: Option<Arc<PodMonitor>>,
}

impl MetaPod {
    pub fn new(pod: Pod, monitor: Option<Arc<PodMonitor>>) -> Self {
        Self { pod, monitor }
    }
}

#[derive(Default)]
pub struct PodCache {
    pods: RwLock<HashMap<PodKey, MetaPod>>,
}

impl PodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from an orchestrator pod-list snapshot. Monitors for
    /// rehydrated pods are created elsewhere.
    pub fn from_pod_list(pods: &[Pod]) -> Self {
        info!(pods = pods.len(), "Rebuilding cache from pod list");

        let cache = Self::new();
        for pod in pods {
            let key = PodKey::from_pod(pod);
            debug!(pod = %key, "Rehydrating pod for cache");
            cache.set(key, MetaPod::new(pod.clone(), None));
        }
        cache
    }

    pub fn get(&self, key: &PodKey) -> Option<MetaPod> {
        self.pods.read().get(key).cloned()
    }

    pub fn set(&self, key: PodKey, value: MetaPod) {
        self.pods.write().insert(key, value);
    }

    /// Replace the pod in an existing entry, keeping its monitor handle.
    pub fn update_pod(&self, key: &PodKey, pod: Pod) -> Result<(), CacheError> {
        let mut pods = self.pods.write();
        match pods.get_mut(key) {
            Some(entry) => {
                entry.pod = pod;
                Ok(())
            }
            None => Err(CacheError::NotFound(key.clone())),
        }
    }

    pub fn delete(&self, key: &PodKey) {
        self.pods.write().remove(key);
    }

    /// Owned snapshot of every entry.
    pub fn get_list(&self) -> Vec<MetaPod> {
        self.pods.read().values().cloned().collect()
    }

    /// Owned snapshot of every pod.
    pub fn get_pod_list(&self) -> Vec<Pod> {
        self.pods.read().values().map(|m| m.pod.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.read().is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("can't find cache member with key {0} to update")]
    NotFound(PodKey),
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn get_returns_last_set_value() {
        let cache = PodCache::new();
        let key = PodKey::new("default", "app1");

        assert!(cache.get(&key).is_none());

        cache.set(key.clone(), MetaPod::new(pod("default", "app1"), None));
        assert_eq!(
            cache.get(&key).unwrap().pod.metadata.name.as_deref(),
            Some("app1")
        );

        let mut updated = pod("default", "app1");
        updated.metadata.uid = Some("uid-2".to_string());
        cache.set(key.clone(), MetaPod::new(updated, None));
        assert_eq!(
            cache.get(&key).unwrap().pod.metadata.uid.as_deref(),
            Some("uid-2")
        );

        cache.delete(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn update_pod_on_missing_key_fails_and_leaves_cache_unchanged() {
        let cache = PodCache::new();
        let key = PodKey::new("default", "ghost");

        let err = cache.update_pod(&key, pod("default", "ghost"));
        assert!(err.is_err());
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn update_pod_replaces_spec_but_keeps_entry() {
        let cache = PodCache::new();
        let key = PodKey::new("default", "app1");
        cache.set(key.clone(), MetaPod::new(pod("default", "app1"), None));

        let mut updated = pod("default", "app1");
        updated.metadata.uid = Some("uid-9".to_string());
        cache.update_pod(&key, updated).unwrap();

        assert_eq!(
            cache.get(&key).unwrap().pod.metadata.uid.as_deref(),
            Some("uid-9")
        );
    }

    #[test]
    fn list_snapshots_are_owned_copies() {
        let cache = PodCache::new();
        cache.set(
            PodKey::new("default", "a"),
            MetaPod::new(pod("default", "a"), None),
        );
        cache.set(
            PodKey::new("kube-system", "b"),
            MetaPod::new(pod("kube-system", "b"), None),
        );

        let list = cache.get_pod_list();
        assert_eq!(list.len(), 2);

        // mutating the cache after listing doesn't disturb the snapshot
        cache.delete(&PodKey::new("default", "a"));
        assert_eq!(list.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn from_pod_list_rehydrates_without_monitors() {
        let pods = vec![pod("default", "p1"), pod("default", "p2")];
        let cache = PodCache::from_pod_list(&pods);

        assert_eq!(cache.len(), 2);
        let entry = cache.get(&PodKey::new("default", "p1")).unwrap();
        assert!(entry.monitor.is_none());
    }
}
