//! Shared per-endpoint agent gateways.
//!
//! The facade, the compute teardown path and every monitor of a pod all
//! talk to the same agent; the pool keys gateways by ip:port so they share
//! one logical connection instead of dialing three.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{AgentFactory, AgentGateway};

pub struct AgentPool {
    factory: Arc<dyn AgentFactory>,
    connections: DashMap<String, Arc<dyn AgentGateway>>,
}

impl AgentPool {
    pub fn new(factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            factory,
            connections: DashMap::new(),
        }
    }

    /// Get (or create) the gateway for an endpoint.
    pub fn gateway_for(&self, ip: &str, port: u16) -> Arc<dyn AgentGateway> {
        let key = endpoint_key(ip, port);
        let entry = self
            .connections
            .entry(key)
            .or_insert_with(|| self.factory.gateway(ip, port));
        entry.value().clone()
    }

    /// Drop the cached gateway for an endpoint. The next `gateway_for` call
    /// dials fresh.
    pub fn evict(&self, ip: &str, port: u16) {
        if self.connections.remove(&endpoint_key(ip, port)).is_some() {
            debug!("evicted agent gateway for {ip}:{port}");
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

fn endpoint_key(ip: &str, port: u16) -> String {
    format!("{ip}:{port}")
}
