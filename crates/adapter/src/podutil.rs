//! Pod helpers: the annotation side-channel and status fixups.
//!
//! Launch attributes for a pod's VM travel in `compute.amazonaws.com/*`
//! annotations; the adapter writes `instance-id` back once compute is bound.

use chrono::Utc;
use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Annotation keys recognized on incoming pods.
pub const ANNOTATION_INSTANCE_PROFILE: &str = "compute.amazonaws.com/instance-profile";
pub const ANNOTATION_IMAGE_ID: &str = "compute.amazonaws.com/image-id";
pub const ANNOTATION_INSTANCE_TYPE: &str = "compute.amazonaws.com/instance-type";
pub const ANNOTATION_KEY_PAIR: &str = "compute.amazonaws.com/key-pair";
pub const ANNOTATION_SECURITY_GROUPS: &str = "compute.amazonaws.com/security-groups";
pub const ANNOTATION_SUBNET_ID: &str = "compute.amazonaws.com/subnet-id";
pub const ANNOTATION_TAGS: &str = "compute.amazonaws.com/tags";

/// Written by the adapter once an instance is bound to the pod.
pub const ANNOTATION_INSTANCE_ID: &str = "compute.amazonaws.com/instance-id";

/// Reason published with the final status of a deleted pod.
pub const REASON_POD_DELETED: &str = "ProviderPodDeleted";

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or_default()
}

pub fn pod_uid(pod: &Pod) -> &str {
    pod.metadata.uid.as_deref().unwrap_or_default()
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.pod_ip.as_deref()
}

/// Read an annotation; absent and empty are both `None`.
pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

pub fn set_annotation(pod: &mut Pod, key: &str, value: &str) {
    pod.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
}

/// Record the pod and host IPs on the pod status, creating the status if the
/// orchestrator never filled one in.
pub fn set_pod_ips(pod: &mut Pod, ip: &str) {
    let status = pod.status.get_or_insert_with(Default::default);
    status.pod_ip = Some(ip.to_string());
    status.host_ip = Some(ip.to_string());
}

/// Final status rewrite for a deleted pod: phase Succeeded, every container
/// marked terminated.
pub fn mark_pod_deleted(pod: &mut Pod) {
    let status = pod.status.get_or_insert_with(Default::default);
    status.phase = Some("Succeeded".to_string());
    status.reason = Some(REASON_POD_DELETED.to_string());

    if let Some(container_statuses) = status.container_statuses.as_mut() {
        for container in container_statuses.iter_mut() {
            container.ready = false;
            container.state = Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code: 0,
                    message: Some("Pod deletion requested".to_string()),
                    finished_at: Some(Time(Utc::now())),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }
}

/// Split on `sep` and trim surrounding whitespace from each element. Empty
/// input yields an empty list.
pub fn trimmed_split(input: &str, sep: char) -> Vec<String> {
    input
        .split(sep)
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}
