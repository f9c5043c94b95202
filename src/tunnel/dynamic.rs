//! Dynamic port forwarding (SOCKS5 proxy).
//!
//! Binds a TCP listener at the tunnel's local address and hands every
//! accepted connection to the embedded SOCKS5 server, which dials
//! CONNECT destinations through the tunnel's SSH session. Relayed byte
//! counts feed the traffic meter under this tunnel's id.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace};

use super::{log_event, TunnelRuntime};
use crate::error::{Error, Result};
use crate::models::LogEvent;
use crate::socks::Socks5Server;
use crate::traffic::TunnelTrafficLogger;

/// Bind the proxy listener and spawn the accept loop.
pub(crate) async fn spawn(rt: TunnelRuntime) -> Result<JoinHandle<()>> {
    let bind_addr = format!("{}:{}", rt.tunnel.local_address, rt.tunnel.local_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::Bind(bind_addr.clone(), e))?;

    let traffic_logger = Arc::new(TunnelTrafficLogger::new(
        rt.tunnel.id,
        Arc::clone(&rt.traffic),
    ));
    let server = Arc::new(Socks5Server::with_traffic_logger(
        Arc::clone(&rt.ssh) as Arc<dyn crate::socks::Dialer>,
        traffic_logger,
    ));

    info!(
        "SOCKS5 proxy for tunnel {} listening on {}",
        rt.tunnel.id, bind_addr
    );

    Ok(tokio::spawn(accept_loop(listener, server, rt)))
}

/// Accept until cancelled, with the same poll-bounded accept as the
/// local forward loop.
async fn accept_loop(listener: TcpListener, server: Arc<Socks5Server>, rt: TunnelRuntime) {
    loop {
        tokio::select! {
            _ = rt.cancel_token.cancelled() => {
                debug!("SOCKS5 proxy for tunnel {} cancelled", rt.tunnel.id);
                break;
            }
            accepted = timeout(rt.accept_poll, listener.accept()) => {
                match accepted {
                    Err(_) => continue,
                    Ok(Ok((stream, peer_addr))) => {
                        trace!(
                            "tunnel {} accepted SOCKS connection from {}",
                            rt.tunnel.id,
                            peer_addr
                        );
                        tokio::spawn(handle_connection(
                            rt.clone(),
                            Arc::clone(&server),
                            stream,
                            peer_addr,
                        ));
                    }
                    Ok(Err(e)) => {
                        if rt.cancel_token.is_cancelled() {
                            break;
                        }
                        error!(
                            "tunnel {} failed to accept SOCKS connection: {}",
                            rt.tunnel.id, e
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    debug!("SOCKS5 accept loop for tunnel {} exited", rt.tunnel.id);
}

async fn handle_connection(
    rt: TunnelRuntime,
    server: Arc<Socks5Server>,
    stream: TcpStream,
    peer_addr: std::net::SocketAddr,
) {
    log_event(
        &rt.repo,
        rt.tunnel.id,
        LogEvent::Connect,
        &format!("SOCKS5 connection from {peer_addr}"),
    )
    .await;

    rt.traffic.increment_connections(rt.tunnel.id);

    if let Err(e) = server
        .handle_connection(stream, peer_addr, rt.cancel_token.clone())
        .await
    {
        debug!("tunnel {} SOCKS5 connection error: {}", rt.tunnel.id, e);
        log_event(
            &rt.repo,
            rt.tunnel.id,
            LogEvent::Error,
            &format!("SOCKS5 connection error: {e}"),
        )
        .await;
    }

    rt.traffic.decrement_connections(rt.tunnel.id);

    log_event(
        &rt.repo,
        rt.tunnel.id,
        LogEvent::Disconnect,
        "SOCKS5 connection closed",
    )
    .await;
}
