//! Local port forwarding.
//!
//! Binds a TCP listener at the tunnel's local address and opens one
//! `direct-tcpip` channel per accepted connection, relaying bytes to the
//! remote destination.

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use super::{log_event, relay, TunnelRuntime};
use crate::error::{Error, Result};
use crate::models::LogEvent;

/// Bind the local listener and spawn the accept loop. Bind failures
/// surface to the caller so a start can fail closed.
pub(crate) async fn spawn(rt: TunnelRuntime) -> Result<JoinHandle<()>> {
    let bind_addr = format!("{}:{}", rt.tunnel.local_address, rt.tunnel.local_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::Bind(bind_addr.clone(), e))?;

    info!(
        "local forward for tunnel {} listening on {} -> {}:{}",
        rt.tunnel.id, bind_addr, rt.tunnel.remote_address, rt.tunnel.remote_port
    );

    Ok(tokio::spawn(accept_loop(listener, rt)))
}

/// Accept until cancelled. Accepts are bounded by the poll interval so an
/// idle listener still observes cancellation; an elapsed poll is not an
/// error. The listener drops with this task, which releases the bind.
async fn accept_loop(listener: TcpListener, rt: TunnelRuntime) {
    loop {
        tokio::select! {
            _ = rt.cancel_token.cancelled() => {
                debug!("local forward for tunnel {} cancelled", rt.tunnel.id);
                break;
            }
            accepted = timeout(rt.accept_poll, listener.accept()) => {
                match accepted {
                    Err(_) => continue,
                    Ok(Ok((stream, peer_addr))) => {
                        trace!("tunnel {} accepted connection from {}", rt.tunnel.id, peer_addr);
                        tokio::spawn(handle_connection(rt.clone(), stream, peer_addr.to_string()));
                    }
                    Ok(Err(e)) => {
                        if rt.cancel_token.is_cancelled() {
                            break;
                        }
                        error!("tunnel {} failed to accept connection: {}", rt.tunnel.id, e);
                        // Avoid a busy loop on persistent accept errors
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    debug!("local forward accept loop for tunnel {} exited", rt.tunnel.id);
}

async fn handle_connection(rt: TunnelRuntime, stream: TcpStream, peer: String) {
    let target = format!("{}:{}", rt.tunnel.remote_address, rt.tunnel.remote_port);

    let channel = match rt
        .ssh
        .open_direct_tcpip(&rt.tunnel.remote_address, rt.tunnel.remote_port)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            error!(
                "tunnel {} failed to dial remote {}: {}",
                rt.tunnel.id, target, e
            );
            log_event(
                &rt.repo,
                rt.tunnel.id,
                LogEvent::Error,
                &format!("Failed to connect to {target}: {e}"),
            )
            .await;
            return;
        }
    };

    log_event(
        &rt.repo,
        rt.tunnel.id,
        LogEvent::Connect,
        &format!("Connection established: {peer} -> {target}"),
    )
    .await;

    match relay::run(stream, channel.into_stream(), rt.cancel_token.clone()).await {
        Ok(stats) => {
            debug!(
                "tunnel {} connection from {} done: {} bytes",
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
