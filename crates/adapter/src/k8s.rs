//! Orchestrator client: the one startup interaction the adapter needs.
//!
//! The pod controller that drives the lifecycle entry points is external;
//! here we only read back the pods already bound to this node so the cache
//! survives a restart.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::info;

use crate::provider::cache::PodCache;

/// List the pods scheduled to `node_name` and build the cache from them.
pub async fn seed_pod_cache(client: Client, node_name: &str) -> Result<PodCache, kube::Error> {
    let pods: Api<Pod> = Api::all(client);
    let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));

    let list = pods.list(&params).await?;
    info!(
        node = node_name,
        pods = list.items.len(),
        "Fetched pod list from orchestrator"
    );

    Ok(PodCache::from_pod_list(&list.items))
}
