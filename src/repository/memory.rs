//! In-memory repository adapter.
//!
//! Backs both repository traits with maps behind one read-write lock.
//! Used by the test-suite and by embedders that do not need durability;
//! semantics (unique names, reference checks, cascading log deletes,
//! newest-first log reads) match what a relational adapter enforces with
//! constraints.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{HostRepository, TunnelRepository};
use crate::error::{Error, Result};
use crate::models::{ConnectionLog, Host, HostStatus, LogEvent, Tunnel, TunnelStatus};

#[derive(Default)]
struct Store {
    hosts: HashMap<i64, Host>,
    tunnels: HashMap<i64, Tunnel>,
    logs: Vec<ConnectionLog>,
    next_host_id: i64,
    next_tunnel_id: i64,
    next_log_id: i64,
}

/// In-process implementation of both repository traits.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Store>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostRepository for MemoryStore {
    async fn create(&self, mut host: Host) -> Result<Host> {
        let mut store = self.inner.write().await;

        if store.hosts.values().any(|h| h.name == host.name) {
            return Err(Error::Conflict(format!(
                "host name '{}' already exists",
                host.name
            )));
        }

        store.next_host_id += 1;
        host.id = store.next_host_id;
        host.created_at = Utc::now();
        host.updated_at = host.created_at;
        store.hosts.insert(host.id, host.clone());
        Ok(host)
    }

    async fn get_by_id(&self, id: i64) -> Result<Host> {
        let store = self.inner.read().await;
        store.hosts.get(&id).cloned().ok_or(Error::HostNotFound(id))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Host>> {
        let store = self.inner.read().await;
        Ok(store.hosts.values().find(|h| h.name == name).cloned())
    }

    async fn list(&self) -> Result<Vec<Host>> {
        let store = self.inner.read().await;
        let mut hosts: Vec<Host> = store.hosts.values().cloned().collect();
        hosts.sort_by_key(|h| h.id);
        Ok(hosts)
    }

    async fn update(&self, host: &Host) -> Result<()> {
        let mut store = self.inner.write().await;

        if !store.hosts.contains_key(&host.id) {
            return Err(Error::HostNotFound(host.id));
        }
        if store
            .hosts
            .values()
            .any(|h| h.id != host.id && h.name == host.name)
        {
            return Err(Error::Conflict(format!(
                "host name '{}' already exists",
                host.name
            )));
        }

        let mut updated = host.clone();
        updated.updated_at = Utc::now();
        store.hosts.insert(updated.id, updated);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut store = self.inner.write().await;

        if !store.hosts.contains_key(&id) {
            return Err(Error::HostNotFound(id));
        }
        if store.tunnels.values().any(|t| t.host_id == id) {
            return Err(Error::Conflict(format!(
                "host {id} is still referenced by tunnels"
            )));
        }

        store.hosts.remove(&id);
        Ok(())
    }

    async fn update_status(
        &self,
        id: i64,
        status: HostStatus,
        last_check: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut store = self.inner.write().await;
        let host = store.hosts.get_mut(&id).ok_or(Error::HostNotFound(id))?;
        host.status = status;
        if last_check.is_some() {
            host.last_check = last_check;
        }
        host.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TunnelRepository for MemoryStore {
    async fn create(&self, mut tunnel: Tunnel) -> Result<Tunnel> {
        let mut store = self.inner.write().await;

        if !store.hosts.contains_key(&tunnel.host_id) {
            return Err(Error::HostNotFound(tunnel.host_id));
        }

        store.next_tunnel_id += 1;
        tunnel.id = store.next_tunnel_id;
        tunnel.created_at = Utc::now();
        tunnel.updated_at = tunnel.created_at;
        store.tunnels.insert(tunnel.id, tunnel.clone());
        Ok(tunnel)
    }

    async fn get_by_id(&self, id: i64) -> Result<Tunnel> {
        let store = self.inner.read().await;
        store
            .tunnels
            .get(&id)
            .cloned()
            .ok_or(Error::TunnelNotFound(id))
    }

    async fn list(&self) -> Result<Vec<Tunnel>> {
        let store = self.inner.read().await;
        let mut tunnels: Vec<Tunnel> = store.tunnels.values().cloned().collect();
        tunnels.sort_by_key(|t| t.id);
        Ok(tunnels)
    }

    async fn list_by_host(&self, host_id: i64) -> Result<Vec<Tunnel>> {
        let store = self.inner.read().await;
        let mut tunnels: Vec<Tunnel> = store
            .tunnels
            .values()
            .filter(|t| t.host_id == host_id)
            .cloned()
            .collect();
        tunnels.sort_by_key(|t| t.id);
        Ok(tunnels)
    }

    async fn list_by_status(&self, status: TunnelStatus) -> Result<Vec<Tunnel>> {
        let store = self.inner.read().await;
        let mut tunnels: Vec<Tunnel> = store
            .tunnels
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tunnels.sort_by_key(|t| t.id);
        Ok(tunnels)
    }

    async fn list_auto_start(&self) -> Result<Vec<Tunnel>> {
        let store = self.inner.read().await;
        let mut tunnels: Vec<Tunnel> = store
            .tunnels
            .values()
            .filter(|t| t.auto_start)
            .cloned()
            .collect();
        tunnels.sort_by_key(|t| t.id);
        Ok(tunnels)
    }

    async fn update(&self, tunnel: &Tunnel) -> Result<()> {
        let mut store = self.inner.write().await;

        if !store.tunnels.contains_key(&tunnel.id) {
            return Err(Error::TunnelNotFound(tunnel.id));
        }

        let mut updated = tunnel.clone();
        updated.updated_at = Utc::now();
        store.tunnels.insert(updated.id, updated);
        Ok(())
    }

    async fn update_status(&self, id: i64, status: TunnelStatus) -> Result<()> {
        let mut store = self.inner.write().await;
        let tunnel = store.tunnels.get_mut(&id).ok_or(Error::TunnelNotFound(id))?;
        tunnel.status = status;
        tunnel.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut store = self.inner.write().await;

        if store.tunnels.remove(&id).is_none() {
            return Err(Error::TunnelNotFound(id));
        }
        store.logs.retain(|log| log.tunnel_id != id);
        Ok(())
    }

    async fn reset_active_tunnels(&self) -> Result<()> {
        let mut store = self.inner.write().await;
        for tunnel in store.tunnels.values_mut() {
            if tunnel.status == TunnelStatus::Active {
                tunnel.status = TunnelStatus::Inactive;
                tunnel.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn append_log(&self, tunnel_id: i64, event: LogEvent, message: &str) -> Result<()> {
        let mut store = self.inner.write().await;
        store.next_log_id += 1;
        let log = ConnectionLog {
            id: store.next_log_id,
            tunnel_id,
            event,
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        store.logs.push(log);
        Ok(())
    }

    async fn logs_for_tunnel(&self, tunnel_id: i64, limit: i64) -> Result<Vec<ConnectionLog>> {
        let store = self.inner.read().await;
        let mut logs: Vec<ConnectionLog> = store
            .logs
            .iter()
            .filter(|log| log.tunnel_id == tunnel_id)
            .cloned()
            .collect();
        // Newest first; ids are monotonic so they break timestamp ties.
        logs.sort_by(|a, b| b.id.cmp(&a.id));
        if limit > 0 {
            logs.truncate(limit as usize);
        }
        Ok(logs)
    }
}
