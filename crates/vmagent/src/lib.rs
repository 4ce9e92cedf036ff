//! Example in-VM agent.
//!
//! A VM provisioned by the adapter runs one of these. It answers the two
//! services the adapter dials: `ApplicationLifecycle` (launch/terminate the
//! pod payload, report its health) and `Health` (the agent process itself).
//! The implementations here are demo-grade: they track the launched manifest
//! in memory and synthesize a running status for it.

pub mod service;

/// Generated protobuf/gRPC code for the agent surface.
pub mod proto {
    tonic::include_proto!("vmnode.agent");
}
