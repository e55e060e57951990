//! Tunnel registry
//!
//! Maps an endpoint id to the tunnel connections currently serving it and
//! selects among them round-robin. Each endpoint's entry lives in a `DashMap`
//! shard, so mutations and selections for one endpoint are serialized by the
//! shard lock while other endpoints proceed in parallel.

use dashmap::DashMap;
use piko_tunnel::TunnelConnection;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("No tunnel available for endpoint: {0}")]
    NoTunnel(String),
}

#[derive(Default)]
struct EndpointEntry {
    connections: Vec<Arc<TunnelConnection>>,
    /// Index of the next connection to hand out
    cursor: usize,
}

/// Registry of live tunnels by endpoint id
#[derive(Default)]
pub struct TunnelRegistry {
    endpoints: DashMap<String, EndpointEntry>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for an endpoint
    ///
    /// Adding the same connection twice is a no-op.
    pub fn add(&self, endpoint_id: &str, conn: Arc<TunnelConnection>) {
        let mut entry = self.endpoints.entry(endpoint_id.to_string()).or_default();
        if entry.connections.iter().any(|c| Arc::ptr_eq(c, &conn)) {
            return;
        }

        info!(
            endpoint_id = %endpoint_id,
            conn_id = %conn.id(),
            "Tunnel registered"
        );
        entry.connections.push(conn);
    }

    /// Deregister a connection; returns false if it was not registered
    pub fn remove(&self, endpoint_id: &str, conn: &TunnelConnection) -> bool {
        let removed = match self.endpoints.get_mut(endpoint_id) {
            Some(mut entry) => {
                let before = entry.connections.len();
                entry.connections.retain(|c| c.id() != conn.id());
                entry.connections.len() != before
            }
            None => false,
        };

        self.endpoints
            .remove_if(endpoint_id, |_, entry| entry.connections.is_empty());

        if removed {
            info!(
                endpoint_id = %endpoint_id,
                conn_id = %conn.id(),
                "Tunnel deregistered"
            );
        }
        removed
    }

    /// Pick the next active connection for an endpoint, round-robin
    pub fn select(&self, endpoint_id: &str) -> Result<Arc<TunnelConnection>, RegistryError> {
        self.select_excluding(endpoint_id, &[])
    }

    /// Like [`select`](Self::select), skipping connections whose id is in
    /// `exclude`
    ///
    /// Connections that are no longer active are pruned from the entry.
    pub fn select_excluding(
        &self,
        endpoint_id: &str,
        exclude: &[String],
    ) -> Result<Arc<TunnelConnection>, RegistryError> {
        let no_tunnel = || RegistryError::NoTunnel(endpoint_id.to_string());

        let selected = {
            let mut entry = self.endpoints.get_mut(endpoint_id).ok_or_else(no_tunnel)?;

            entry.connections.retain(|c| {
                let active = c.is_active();
                if !active {
                    debug!(
                        endpoint_id = %endpoint_id,
                        conn_id = %c.id(),
                        state = %c.state(),
                        "Pruning inactive tunnel"
                    );
                }
                active
            });

            let count = entry.connections.len();
            let start = entry.cursor;
            let mut selected = None;
            for offset in 0..count {
                let index = (start + offset) % count;
                let conn = &entry.connections[index];
                if !exclude.iter().any(|id| id == conn.id()) {
                    selected = Some(conn.clone());
                    entry.cursor = (index + 1) % count;
                    break;
                }
            }
            selected
        };

        if selected.is_none() {
            self.endpoints
                .remove_if(endpoint_id, |_, entry| entry.connections.is_empty());
        }
        selected.ok_or_else(no_tunnel)
    }

    /// Endpoints with at least one registered connection
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of connections registered for an endpoint
    pub fn connection_count(&self, endpoint_id: &str) -> usize {
        self.endpoints
            .get(endpoint_id)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    /// Connections registered for an endpoint
    pub fn endpoint_connections(&self, endpoint_id: &str) -> Vec<Arc<TunnelConnection>> {
        self.endpoints
            .get(endpoint_id)
            .map(|entry| entry.connections.clone())
            .unwrap_or_default()
    }

    /// Every registered connection
    pub fn connections(&self) -> Vec<Arc<TunnelConnection>> {
        self.endpoints
            .iter()
            .flat_map(|entry| entry.connections.clone())
            .collect()
    }

    /// Total number of registered connections
    pub fn len(&self) -> usize {
        self.endpoints
            .iter()
            .map(|entry| entry.connections.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}
