//! Tunnel lifecycle engine.
//!
//! The engine owns the registry of running tunnels and drives the three
//! forwarding kinds:
//!
//! - [`local`]: local listener, connections forwarded over SSH to a
//!   remote destination
//! - [`remote`]: listener on the remote host via `tcpip-forward`,
//!   connections forwarded back to a local destination
//! - [`dynamic`]: local SOCKS5 proxy dialling through SSH
//!
//! Every accept loop runs as its own task and observes its tunnel's
//! cancellation token; accepted connections are handled on per-connection
//! tasks that feed the connection log and, for dynamic tunnels, the
//! traffic meter.

pub mod dynamic;
pub mod engine;
pub mod local;
pub mod relay;
pub mod remote;

pub use engine::{BatchOutcome, ServiceMapping, TunnelEngine};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::models::{LogEvent, Tunnel};
use crate::repository::TunnelRepository;
use crate::ssh::SshClient;
use crate::traffic::TrafficMeter;

/// Everything an accept loop and its connection handlers need, cloned
/// into each spawned task.
#[derive(Clone)]
pub(crate) struct TunnelRuntime {
    pub tunnel: Tunnel,
    pub repo: Arc<dyn TunnelRepository>,
    pub ssh: Arc<SshClient>,
    pub traffic: Arc<TrafficMeter>,
    pub cancel_token: CancellationToken,
    /// Accept re-arm cadence; bounds how long cancellation can go
    /// unobserved on an idle listener.
    pub accept_poll: Duration,
}

/// Append an event to a tunnel's connection log. Log storage failures are
/// reported through tracing and otherwise swallowed; the data plane never
/// stalls on the log.
pub(crate) async fn log_event(
    repo: &Arc<dyn TunnelRepository>,
    tunnel_id: i64,
    event: LogEvent,
    message: &str,
) {
    if let Err(e) = repo.append_log(tunnel_id, event, message).await {
        tracing::warn!(
            "failed to append {} log for tunnel {}: {}",
            event,
            tunnel_id,
            e
        );
    }
}
