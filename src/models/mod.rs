//! Persisted records and in-memory statistics types.
//!
//! `Host`, `Tunnel` and `ConnectionLog` map 1:1 onto the `hosts`,
//! `tunnels` and `connection_logs` tables of whatever store backs the
//! repository traits. Field names on the wire match the JSON/column names
//! the management API has always used, so the serde attributes here are
//! load-bearing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a host authenticates its SSH sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    /// Password authentication
    Password,
    /// Private key (inline PEM or on-disk path)
    Key,
    /// Private key protected by a passphrase
    KeyPassword,
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthKind::Password => write!(f, "password"),
            AuthKind::Key => write!(f, "key"),
            AuthKind::KeyPassword => write!(f, "key_password"),
        }
    }
}

/// Host reachability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Active,
    Inactive,
    Error,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Active => write!(f, "active"),
            HostStatus::Inactive => write!(f, "inactive"),
            HostStatus::Error => write!(f, "error"),
        }
    }
}

/// A remote SSH endpoint with stored credentials.
///
/// The three secret fields (`password`, `private_key`, `passphrase`) are
/// ciphertext at rest; the host service encrypts them on the way in and
/// decrypts them on the way out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(rename = "auth_type")]
    pub auth_kind: AuthKind,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key: String,
    /// Path to a private key file on disk, used when `private_key` is empty
    #[serde(default)]
    pub key_path: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_host_status")]
    pub status: HostStatus,
    #[serde(default)]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_host_status() -> HostStatus {
    HostStatus::Inactive
}

/// The three forwarding kinds a tunnel can run as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
    /// Local listener forwarding to a remote address through SSH
    LocalForward,
    /// Listener on the remote host forwarding back to a local address
    RemoteForward,
    /// Local SOCKS5 proxy dialling through SSH
    Dynamic,
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelKind::LocalForward => write!(f, "local_forward"),
            TunnelKind::RemoteForward => write!(f, "remote_forward"),
            TunnelKind::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Tunnel lifecycle status as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Inactive,
    Error,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Active => write!(f, "active"),
            TunnelStatus::Inactive => write!(f, "inactive"),
            TunnelStatus::Error => write!(f, "error"),
        }
    }
}

/// A persisted tunnel configuration.
///
/// `remote_address`/`remote_port` are required for the two forward kinds
/// and unused for `dynamic`; an empty string / zero port means unset,
/// matching the columns' defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    #[serde(default)]
    pub id: i64,
    pub host_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TunnelKind,
    #[serde(default = "default_local_address")]
    pub local_address: String,
    pub local_port: u16,
    #[serde(default)]
    pub remote_address: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_tunnel_status")]
    pub status: TunnelStatus,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_tunnel_status() -> TunnelStatus {
    TunnelStatus::Inactive
}

/// Kinds of events recorded against a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    Connect,
    Disconnect,
    Error,
    Start,
    Stop,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEvent::Connect => write!(f, "connect"),
            LogEvent::Disconnect => write!(f, "disconnect"),
            LogEvent::Error => write!(f, "error"),
            LogEvent::Start => write!(f, "start"),
            LogEvent::Stop => write!(f, "stop"),
        }
    }
}

/// Append-only per-tunnel event log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLog {
    #[serde(default)]
    pub id: i64,
    pub tunnel_id: i64,
    #[serde(rename = "event_type")]
    pub event: LogEvent,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// In-memory per-tunnel traffic counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeTrafficStats {
    pub tunnel_id: i64,
    #[serde(rename = "current_bytes_in")]
    pub bytes_in: u64,
    #[serde(rename = "current_bytes_out")]
    pub bytes_out: u64,
    pub active_connections: u32,
    /// Instantaneous inbound rate in bytes/second
    pub speed_in: f64,
    /// Instantaneous outbound rate in bytes/second
    pub speed_out: f64,
    #[serde(rename = "last_update_time")]
    pub last_update: DateTime<Utc>,
}

impl RealtimeTrafficStats {
    pub fn empty(tunnel_id: i64) -> Self {
        Self {
            tunnel_id,
            bytes_in: 0,
            bytes_out: 0,
            active_connections: 0,
            speed_in: 0.0,
            speed_out: 0.0,
            last_update: Utc::now(),
        }
    }
}

/// Aggregated traffic over a time window. Historical persistence is not
/// implemented, so range queries currently yield no samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSample {
    pub tunnel_id: i64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}
