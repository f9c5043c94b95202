//! Persistence contract consumed by the services.
//!
//! The manager core does not own a database; it talks to these traits and
//! leaves the adapter choice (SQLite, Postgres, ...) to the embedding
//! application. [`memory::MemoryStore`] provides an in-process adapter
//! used by the test-suite and by embedders that do not need durability.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{ConnectionLog, Host, LogEvent, Tunnel, TunnelStatus};

/// Store for host records.
///
/// Implementations are expected to be concurrency-safe; the services call
/// them without holding their own locks.
#[async_trait]
pub trait HostRepository: Send + Sync {
    /// Insert a host and return the stored record with its assigned id.
    async fn create(&self, host: Host) -> Result<Host>;

    async fn get_by_id(&self, id: i64) -> Result<Host>;

    /// Look a host up by its unique name. `None` when absent.
    async fn get_by_name(&self, name: &str) -> Result<Option<Host>>;

    async fn list(&self) -> Result<Vec<Host>>;

    async fn update(&self, host: &Host) -> Result<()>;

    /// Delete a host. Fails with a conflict while any tunnel still
    /// references it.
    async fn delete(&self, id: i64) -> Result<()>;

    async fn update_status(
        &self,
        id: i64,
        status: crate::models::HostStatus,
        last_check: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<()>;
}

/// Store for tunnel records and their connection logs.
#[async_trait]
pub trait TunnelRepository: Send + Sync {
    /// Insert a tunnel and return the stored record with its assigned id.
    async fn create(&self, tunnel: Tunnel) -> Result<Tunnel>;

    async fn get_by_id(&self, id: i64) -> Result<Tunnel>;

    async fn list(&self) -> Result<Vec<Tunnel>>;

    async fn list_by_host(&self, host_id: i64) -> Result<Vec<Tunnel>>;

    async fn list_by_status(&self, status: TunnelStatus) -> Result<Vec<Tunnel>>;

    async fn list_auto_start(&self) -> Result<Vec<Tunnel>>;

    async fn update(&self, tunnel: &Tunnel) -> Result<()>;

    async fn update_status(&self, id: i64, status: TunnelStatus) -> Result<()>;

    /// Delete a tunnel together with its connection logs.
    async fn delete(&self, id: i64) -> Result<()>;

    /// Collapse every `active` tunnel back to `inactive`. Run once at
    /// process start, before any handle exists.
    async fn reset_active_tunnels(&self) -> Result<()>;

    /// Append one event to a tunnel's connection log.
    async fn append_log(&self, tunnel_id: i64, event: LogEvent, message: &str) -> Result<()>;

    /// Connection logs for a tunnel, newest first. A non-positive limit
    /// returns everything.
    async fn logs_for_tunnel(&self, tunnel_id: i64, limit: i64) -> Result<Vec<ConnectionLog>>;
}
