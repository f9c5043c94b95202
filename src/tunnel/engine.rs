//! Tunnel lifecycle management.
//!
//! One [`TunnelEngine`] owns the registry of running tunnels. Accept
//! loops never touch the registry; they hold only their own cancellation
//! token, so the registry lock is limited to map insert/lookup/remove.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{dynamic, local, log_event, remote, TunnelRuntime};
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::hosts::HostService;
use crate::models::{ConnectionLog, LogEvent, Tunnel, TunnelKind, TunnelStatus};
use crate::repository::TunnelRepository;
use crate::ssh::{AuthMethod, ServerCheck, SshClient};
use crate::traffic::TrafficMeter;

/// Preferred port range for new SOCKS5 proxies, then the fallback range.
const SOCKS5_PORT_RANGE: (u16, u16) = (1080, 1090);
const SOCKS5_FALLBACK_PORT_RANGE: (u16, u16) = (8080, 8090);

/// One entry in a batch request mapping a local service to a remote port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub name: String,
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub description: String,
}

/// Result of a best-effort batch create: what succeeded, plus one message
/// per entry that failed.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub created: Vec<Tunnel>,
    pub errors: Vec<String>,
}

/// A running tunnel: the resources released when it stops.
struct ActiveTunnel {
    tunnel: Tunnel,
    ssh: Arc<SshClient>,
    cancel_token: CancellationToken,
    accept_task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Owns tunnel records, running handles and the operations on them.
pub struct TunnelEngine {
    repo: Arc<dyn TunnelRepository>,
    hosts: Arc<HostService>,
    traffic: Arc<TrafficMeter>,
    active: Arc<RwLock<HashMap<i64, ActiveTunnel>>>,
    timeouts: Timeouts,
    server_check: ServerCheck,
}

impl TunnelEngine {
    pub fn new(
        repo: Arc<dyn TunnelRepository>,
        hosts: Arc<HostService>,
        traffic: Arc<TrafficMeter>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            repo,
            hosts,
            traffic,
            active: Arc::new(RwLock::new(HashMap::new())),
            timeouts,
            server_check: ServerCheck::default(),
        }
    }

    /// Replace the host key policy used for tunnel SSH sessions.
    pub fn with_server_check(mut self, server_check: ServerCheck) -> Self {
        self.server_check = server_check;
        self
    }

    pub fn traffic(&self) -> &Arc<TrafficMeter> {
        &self.traffic
    }

    /// Collapse every persisted `active` status back to `inactive`. Call
    /// once at process start, before any tunnel is started: no handles
    /// exist yet, so a persisted `active` is stale by definition.
    pub async fn reset_stale_states(&self) -> Result<()> {
        self.repo.reset_active_tunnels().await
    }

    /// Validate and persist a new tunnel. The record starts out inactive.
    pub async fn create(&self, mut tunnel: Tunnel) -> Result<Tunnel> {
        validate_config(&mut tunnel)?;
        self.check_port_availability(&tunnel).await?;
        tunnel.status = TunnelStatus::Inactive;
        self.repo.create(tunnel).await
    }

    /// Create remote-forward records for a batch of local services.
    /// Failing entries do not abort the batch; their errors are collected
    /// in the outcome.
    pub async fn create_multiple_local_forwards(
        &self,
        host_id: i64,
        services: Vec<ServiceMapping>,
    ) -> Result<BatchOutcome> {
        if services.is_empty() {
            return Err(Error::Validation("services list is empty".to_string()));
        }

        let mut outcome = BatchOutcome::default();
        for service in services {
            let tunnel = Tunnel {
                id: 0,
                host_id,
                name: service.name,
                kind: TunnelKind::RemoteForward,
                local_address: service.local_address,
                local_port: service.local_port,
                remote_address: service.remote_address,
                remote_port: service.remote_port,
                description: service.description,
                status: TunnelStatus::Inactive,
                auto_start: service.auto_start,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            let label = format!("{}:{}", tunnel.local_address, tunnel.local_port);

            match self.create(tunnel).await {
                Ok(created) => outcome.created.push(created),
                Err(e) => outcome
                    .errors
                    .push(format!("Failed to create tunnel for {label} - {e}")),
            }
        }

        Ok(outcome)
    }

    /// Create a dynamic tunnel on the first free SOCKS port: 1080-1090,
    /// falling back to 8080-8090.
    pub async fn create_dynamic_tunnel(
        &self,
        host_id: i64,
        name: String,
        description: String,
        auto_start: bool,
    ) -> Result<Tunnel> {
        let (start, end) = SOCKS5_PORT_RANGE;
        let local_port = match self.find_available_port(start, end, "localhost").await {
            Ok(port) => port,
            Err(_) => {
                let (start, end) = SOCKS5_FALLBACK_PORT_RANGE;
                self.find_available_port(start, end, "localhost").await?
            }
        };

        let tunnel = Tunnel {
            id: 0,
            host_id,
            name,
            kind: TunnelKind::Dynamic,
            local_address: "localhost".to_string(),
            local_port,
            remote_address: String::new(),
            remote_port: 0,
            description,
            status: TunnelStatus::Inactive,
            auto_start,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        self.create(tunnel).await
    }

    /// First port in `[start, end]` on which a transient bind succeeds.
    /// An empty address means `localhost`.
    pub async fn find_available_port(&self, start: u16, end: u16, address: &str) -> Result<u16> {
        let address = if address.is_empty() { "localhost" } else { address };

        for port in start..=end {
            if let Ok(listener) = TcpListener::bind((address, port)).await {
                drop(listener);
                return Ok(port);
            }
        }

        Err(Error::NoAvailablePort { start, end })
    }

    pub async fn get(&self, id: i64) -> Result<Tunnel> {
        self.repo.get_by_id(id).await
    }

    pub async fn get_all(&self) -> Result<Vec<Tunnel>> {
        self.repo.list().await
    }

    pub async fn get_by_host(&self, host_id: i64) -> Result<Vec<Tunnel>> {
        self.repo.list_by_host(host_id).await
    }

    /// Revalidate and persist an updated tunnel. A running tunnel is
    /// stopped, updated and started again; a restart failure leaves it in
    /// the error state.
    pub async fn update(&self, mut tunnel: Tunnel) -> Result<()> {
        validate_config(&mut tunnel)?;

        let running = {
            let active = self.active.read().await;
            active.contains_key(&tunnel.id)
        };

        if running {
            self.stop(tunnel.id).await?;
            self.repo.update(&tunnel).await?;
            return self.start(tunnel.id).await;
        }

        self.repo.update(&tunnel).await
    }

    /// Stop (best-effort) and delete a tunnel with its connection logs.
    pub async fn delete(&self, id: i64) -> Result<()> {
        match self.stop(id).await {
            Ok(()) | Err(Error::NotRunning) => {}
            Err(e) => warn!("failed to stop tunnel {} before deletion: {}", id, e),
        }

        self.repo.delete(id).await?;
        self.traffic.forget(id);
        Ok(())
    }

    /// Start a tunnel: resolve its host, dial SSH, bind the listener for
    /// its kind and register the running handle. Any failure releases
    /// what was acquired and leaves the persisted status at `error`.
    pub async fn start(&self, id: i64) -> Result<()> {
        {
            let active = self.active.read().await;
            if active.contains_key(&id) {
                return Err(Error::AlreadyRunning);
            }
        }

        let tunnel = self.repo.get_by_id(id).await?;
        let host = self.hosts.get(tunnel.host_id).await?;

        let auth = match AuthMethod::for_host(&host) {
            Ok(auth) => auth,
            Err(e) => {
                self.fail_start(id, &format!("SSH connection failed: {e}")).await;
                return Err(e);
            }
        };

        let ssh = match SshClient::connect(
            &host.hostname,
            host.port,
            &host.username,
            auth,
            self.server_check.clone(),
            self.timeouts.ssh_dial(),
        )
        .await
        {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.fail_start(id, &format!("SSH connection failed: {e}")).await;
                return Err(e);
            }
        };

        let cancel_token = CancellationToken::new();
        let runtime = TunnelRuntime {
            tunnel: tunnel.clone(),
            repo: Arc::clone(&self.repo),
            ssh: Arc::clone(&ssh),
            traffic: Arc::clone(&self.traffic),
            cancel_token: cancel_token.clone(),
            accept_poll: self.timeouts.accept_poll(),
        };

        let spawned = match tunnel.kind {
            TunnelKind::LocalForward => local::spawn(runtime).await,
            TunnelKind::RemoteForward => remote::spawn(runtime).await,
            TunnelKind::Dynamic => dynamic::spawn(runtime).await,
        };

        let accept_task = match spawned {
            Ok(task) => task,
            Err(e) => {
                cancel_token.cancel();
                let _ = ssh.disconnect().await;
                self.fail_start(id, &format!("Failed to start tunnel: {e}")).await;
                return Err(e);
            }
        };

        {
            let mut active = self.active.write().await;
            if active.contains_key(&id) {
                // Lost a start race; unwind our resources.
                cancel_token.cancel();
                let _ = accept_task.await;
                let _ = ssh.disconnect().await;
                return Err(Error::AlreadyRunning);
            }
            active.insert(
                id,
                ActiveTunnel {
                    tunnel,
                    ssh,
                    cancel_token,
                    accept_task,
                    started_at: Utc::now(),
                },
            );
        }

        if let Err(e) = self.repo.update_status(id, TunnelStatus::Active).await {
            warn!("failed to persist active status for tunnel {}: {}", id, e);
        }
        log_event(&self.repo, id, LogEvent::Start, "Tunnel started successfully").await;

        info!("tunnel {} started", id);
        Ok(())
    }

    /// Stop a running tunnel.
    ///
    /// Teardown order is part of the contract: cancel (which makes the
    /// accept loop drop its listener, releasing the bind), wait for the
    /// loop to exit, close the SSH client, then settle briefly before
    /// declaring the port released.
    pub async fn stop(&self, id: i64) -> Result<()> {
        let handle = {
            let mut active = self.active.write().await;
            active.remove(&id)
        };

        let Some(handle) = handle else {
            return Err(Error::NotRunning);
        };

        info!("stopping tunnel {}", id);

        handle.cancel_token.cancel();
        if handle.accept_task.await.is_err() {
            warn!("accept loop for tunnel {} ended abnormally", id);
        }

        if let Err(e) = handle.ssh.disconnect().await {
            // The session may already be gone; that is a normal stop.
            debug!("tunnel {} SSH disconnect: {}", id, e);
        }

        tokio::time::sleep(self.timeouts.stop_settle()).await;

        self.repo.update_status(id, TunnelStatus::Inactive).await?;
        log_event(&self.repo, id, LogEvent::Stop, "Tunnel stopped and port released").await;

        info!(
            "tunnel {} ({}) stopped after {}s",
            id,
            handle.tunnel.name,
            (Utc::now() - handle.started_at).num_seconds()
        );
        Ok(())
    }

    /// Stop (tolerating not-running), pause, start.
    pub async fn restart(&self, id: i64) -> Result<()> {
        match self.stop(id).await {
            Ok(()) | Err(Error::NotRunning) => {}
            Err(e) => return Err(e),
        }

        tokio::time::sleep(self.timeouts.restart_pause()).await;

        self.start(id).await
    }

    /// Live status: `active` while a handle is registered, otherwise the
    /// persisted status.
    pub async fn status(&self, id: i64) -> Result<TunnelStatus> {
        {
            let active = self.active.read().await;
            if active.contains_key(&id) {
                return Ok(TunnelStatus::Active);
            }
        }

        Ok(self.repo.get_by_id(id).await?.status)
    }

    /// Start every auto-start tunnel. Per-tunnel failures are logged and
    /// do not abort the batch.
    pub async fn start_auto_tunnels(&self) -> Result<()> {
        let tunnels = self.repo.list_auto_start().await?;

        for tunnel in tunnels {
            if let Err(e) = self.start(tunnel.id).await {
                error!(
                    "failed to start auto tunnel {} ({}): {}",
                    tunnel.id, tunnel.name, e
                );
            }
        }

        Ok(())
    }

    /// Stop every running tunnel. The registry is snapshotted first so no
    /// lock is held across teardown; per-tunnel failures are logged and
    /// do not abort the sweep.
    pub async fn stop_all(&self) -> Result<()> {
        let ids: Vec<i64> = {
            let active = self.active.read().await;
            active.keys().copied().collect()
        };

        for id in ids {
            if let Err(e) = self.stop(id).await {
                error!("failed to stop tunnel {}: {}", id, e);
            }
        }

        Ok(())
    }

    /// Connection logs for a tunnel, newest first. A non-positive limit
    /// returns everything.
    pub async fn logs(&self, id: i64, limit: i64) -> Result<Vec<ConnectionLog>> {
        self.repo.logs_for_tunnel(id, limit).await
    }

    /// Probe a local service with a bounded TCP dial.
    pub async fn check_service_health(&self, address: &str, port: u16) -> Result<()> {
        let target = format!("{address}:{port}");

        match tokio::time::timeout(self.timeouts.health_check(), TcpStream::connect(&target)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Connection(format!(
                "service {target} is not available: {e}"
            ))),
            Err(_) => Err(Error::Connection(format!(
                "service {target} is not available: connection timed out"
            ))),
        }
    }

    /// Ids of tunnels with a registered running handle.
    pub async fn running_ids(&self) -> Vec<i64> {
        let active = self.active.read().await;
        let mut ids: Vec<i64> = active.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Record the failure and collapse the tunnel into the error state.
    async fn fail_start(&self, id: i64, message: &str) {
        log_event(&self.repo, id, LogEvent::Error, message).await;
        if let Err(e) = self.repo.update_status(id, TunnelStatus::Error).await {
            warn!("failed to persist error status for tunnel {}: {}", id, e);
        }
    }

    /// Advisory create-time check: the {address, port} pair must not
    /// clash with another persisted tunnel and a transient bind must
    /// currently succeed. A later start can still lose the race and will
    /// fail closed on its own bind.
    async fn check_port_availability(&self, tunnel: &Tunnel) -> Result<()> {
        let local_addr = format!("{}:{}", tunnel.local_address, tunnel.local_port);
        let listener = TcpListener::bind(&local_addr)
            .await
            .map_err(|e| Error::Bind(local_addr, e))?;
        drop(listener);

        let existing = self.repo.list().await?;
        for other in existing {
            if other.id == tunnel.id {
                continue;
            }
            if other.local_port == tunnel.local_port && other.local_address == tunnel.local_address
            {
                return Err(Error::Conflict(format!(
                    "local port {}:{} already in use by tunnel {}",
                    tunnel.local_address, tunnel.local_port, other.id
                )));
            }
            if tunnel.kind == TunnelKind::RemoteForward
                && other.kind == TunnelKind::RemoteForward
                && other.host_id == tunnel.host_id
                && other.remote_port == tunnel.remote_port
                && other.remote_address == tunnel.remote_address
            {
                return Err(Error::Conflict(format!(
                    "remote port {}:{} already in use by tunnel {}",
                    tunnel.remote_address, tunnel.remote_port, other.id
                )));
            }
        }

        Ok(())
    }
}

/// Kind-specific field validation. Fills the documented defaults (local
/// address 127.0.0.1, remote-forward bind address 0.0.0.0) in place.
fn validate_config(tunnel: &mut Tunnel) -> Result<()> {
    if tunnel.name.is_empty() {
        return Err(Error::Validation("tunnel name is required".to_string()));
    }
    if tunnel.host_id <= 0 {
        return Err(Error::Validation("host ID is required".to_string()));
    }
    if tunnel.local_port == 0 {
        return Err(Error::Validation("local port is required".to_string()));
    }
    if tunnel.local_address.is_empty() {
        tunnel.local_address = "127.0.0.1".to_string();
    }

    match tunnel.kind {
        TunnelKind::LocalForward => {
            if tunnel.remote_address.is_empty() {
                return Err(Error::Validation(
                    "remote address is required for local forward".to_string(),
                ));
            }
            if tunnel.remote_port == 0 {
                return Err(Error::Validation(
                    "remote port is required for local forward".to_string(),
                ));
            }
        }
        TunnelKind::RemoteForward => {
            if tunnel.remote_address.is_empty() {
                tunnel.remote_address = "0.0.0.0".to_string();
            }
            if tunnel.remote_port == 0 {
                return Err(Error::Validation(
                    "remote port is required for remote forward".to_string(),
                ));
            }
        }
        TunnelKind::Dynamic => {
            // No remote endpoint; destinations come per-connection.
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tunnel_of_kind(kind: TunnelKind) -> Tunnel {
        Tunnel {
            id: 0,
            host_id: 1,
            name: "t".to_string(),
            kind,
            local_address: String::new(),
            local_port: 9000,
            remote_address: String::new(),
            remote_port: 0,
            description: String::new(),
            status: TunnelStatus::Inactive,
            auto_start: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_validate_fills_defaults() {
        let mut tunnel = tunnel_of_kind(TunnelKind::RemoteForward);
        tunnel.remote_port = 8080;
        validate_config(&mut tunnel).unwrap();
        assert_eq!(tunnel.local_address, "127.0.0.1");
        assert_eq!(tunnel.remote_address, "0.0.0.0");
    }

    #[test]
    fn test_validate_required_fields() {
        let mut tunnel = tunnel_of_kind(TunnelKind::LocalForward);
        tunnel.name = String::new();
        assert!(validate_config(&mut tunnel).is_err());

        let mut tunnel = tunnel_of_kind(TunnelKind::LocalForward);
        tunnel.host_id = 0;
        assert!(validate_config(&mut tunnel).is_err());

        let mut tunnel = tunnel_of_kind(TunnelKind::LocalForward);
        tunnel.local_port = 0;
        assert!(validate_config(&mut tunnel).is_err());

        // Local forward needs a remote endpoint
        let mut tunnel = tunnel_of_kind(TunnelKind::LocalForward);
        assert!(validate_config(&mut tunnel).is_err());
        tunnel.remote_address = "10.0.0.5".to_string();
        assert!(validate_config(&mut tunnel).is_err());
        tunnel.remote_port = 5432;
        assert!(validate_config(&mut tunnel).is_ok());

        // Dynamic needs none
        let mut tunnel = tunnel_of_kind(TunnelKind::Dynamic);
        assert!(validate_config(&mut tunnel).is_ok());
    }
}
