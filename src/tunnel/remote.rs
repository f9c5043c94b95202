//! Remote port forwarding.
//!
//! Requests a `tcpip-forward` listener on the SSH server; inbound
//! connections arrive as forwarded-tcpip channels on the session and are
//! relayed to the tunnel's local destination. Whether a non-loopback
//! remote bind is honoured is the server's gateway-ports policy and not
//! observable here.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{log_event, relay, TunnelRuntime};
use crate::error::{Error, Result};
use crate::models::LogEvent;
use crate::ssh::ForwardedConnection;

/// Establish the remote listener and spawn the delivery loop.
pub(crate) async fn spawn(rt: TunnelRuntime) -> Result<JoinHandle<()>> {
    rt.ssh
        .request_remote_listener(&rt.tunnel.remote_address, rt.tunnel.remote_port)
        .await?;

    let receiver = rt.ssh.take_forwarded_receiver().ok_or_else(|| {
        Error::SshListen("forwarded connection receiver already claimed".to_string())
    })?;

    info!(
        "remote forward for tunnel {} listening on remote {}:{} -> {}:{}",
        rt.tunnel.id,
        rt.tunnel.remote_address,
        rt.tunnel.remote_port,
        rt.tunnel.local_address,
        rt.tunnel.local_port
    );

    Ok(tokio::spawn(accept_loop(receiver, rt)))
}

/// Drain forwarded connections until cancellation or session teardown.
/// Unlike the locally-bound loops there is no accept deadline; closing
/// the session (and the cancel-tcpip-forward on the way out) wakes this
/// loop up.
async fn accept_loop(mut receiver: mpsc::UnboundedReceiver<ForwardedConnection>, rt: TunnelRuntime) {
    loop {
        tokio::select! {
            _ = rt.cancel_token.cancelled() => {
                debug!("remote forward for tunnel {} cancelled", rt.tunnel.id);
                break;
            }
            forwarded = receiver.recv() => {
                match forwarded {
                    Some(conn) => {
                        tokio::spawn(handle_connection(rt.clone(), conn));
                    }
                    None => {
                        debug!(
                            "remote forward session for tunnel {} closed",
                            rt.tunnel.id
                        );
                        break;
                    }
                }
            }
        }
    }

    // Release the remote bind; the session may already be gone.
    if let Err(e) = rt
        .ssh
        .cancel_remote_listener(&rt.tunnel.remote_address, rt.tunnel.remote_port)
        .await
    {
        debug!(
            "tunnel {} cancel of remote listener failed: {}",
            rt.tunnel.id, e
        );
    }

    debug!("remote forward accept loop for tunnel {} exited", rt.tunnel.id);
}

async fn handle_connection(rt: TunnelRuntime, conn: ForwardedConnection) {
    let local_target = format!("{}:{}", rt.tunnel.local_address, rt.tunnel.local_port);
    let peer = format!("{}:{}", conn.originator_address, conn.originator_port);

    let local_stream = match TcpStream::connect(&local_target).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(
                "tunnel {} failed to dial local {}: {}",
                rt.tunnel.id, local_target, e
            );
            log_event(
                &rt.repo,
                rt.tunnel.id,
                LogEvent::Error,
                &format!("Failed to connect to {local_target}: {e}"),
            )
            .await;
            return;
        }
    };

    log_event(
        &rt.repo,
        rt.tunnel.id,
        LogEvent::Connect,
        &format!("Connection established: {peer} -> {local_target}"),
    )
    .await;

    match relay::run(
        conn.channel.into_stream(),
        local_stream,
        rt.cancel_token.clone(),
    )
    .await
    {
        Ok(stats) => {
            debug!(
                "tunnel {} forwarded connection from {} done: {} bytes",
                rt.tunnel.id,
                peer,
                stats.total_bytes()
            );
        }
        Err(e) => {
            log_event(
                &rt.repo,
                rt.tunnel.id,
                LogEvent::Error,
                &format!("Relay failed for {peer}: {e}"),
            )
            .await;
        }
    }

    log_event(&rt.repo, rt.tunnel.id, LogEvent::Disconnect, "Connection closed").await;
}
