//! vmnode adapter: projects externally-hosted VMs into a cluster as pods on
//! one virtual node.
//!
//! The orchestrator schedules pods to this node; each is realized as a
//! dedicated VM carrying an in-VM agent. The [`provider`] facade implements
//! the pod-lifecycle contract, [`compute`] acquires and releases VMs (warm
//! pool included), [`agent`] dials the in-VM agents, and [`health`] keeps
//! per-pod probes running and pushes status back through the notifier.

pub mod agent;
pub mod compute;
pub mod config;
pub mod health;
pub mod k8s;
pub mod metrics;
pub mod podutil;
pub mod provider;
