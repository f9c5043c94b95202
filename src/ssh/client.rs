//! SSH connection management.

use russh::client::{Config, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelMsg, Disconnect};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::auth::{authenticate, AuthMethod, ServerCheck};
use crate::error::{Error, Result};

/// An inbound connection delivered by the server for an established
/// `tcpip-forward` listener.
pub struct ForwardedConnection {
    pub channel: Channel<Msg>,
    /// Address the remote listener was bound to
    pub connected_address: String,
    pub connected_port: u32,
    /// Peer that connected on the remote side
    pub originator_address: String,
    pub originator_port: u32,
}

/// russh event handler: server key policy plus delivery of
/// forwarded-tcpip channels to whoever holds the receiver.
pub struct TunnelHandler {
    hostname: String,
    port: u16,
    server_check: ServerCheck,
    forwarded_tx: mpsc::UnboundedSender<ForwardedConnection>,
}

impl Handler for TunnelHandler {
    type Error = Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.server_check {
            ServerCheck::AcceptAll => Ok(true),
            ServerCheck::DefaultKnownHosts => {
                russh::keys::check_known_hosts(&self.hostname, self.port, server_public_key)
                    .map_err(|e| Error::SshAuth(format!("host key verification failed: {e}")))
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        tracing::debug!(
            "forwarded connection from {}:{} on {}:{}",
            originator_address,
            originator_port,
            connected_address,
            connected_port
        );

        // Receiver side may already be gone during teardown; the channel
        // is dropped (closed) in that case.
        let _ = self.forwarded_tx.send(ForwardedConnection {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        });
        Ok(())
    }
}

/// An authenticated SSH connection to one host.
///
/// Each running tunnel owns exactly one client; it is never shared across
/// tunnels. The SOCKS server and per-connection handlers only borrow it
/// for the duration of a dial.
pub struct SshClient {
    session: Arc<Mutex<Handle<TunnelHandler>>>,
    username: String,
    address: SocketAddr,
    forwarded_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ForwardedConnection>>>,
}

impl SshClient {
    /// Open and authenticate a connection.
    ///
    /// All addresses the hostname resolves to are tried in order; the
    /// whole dial (TCP + SSH handshake) is bounded by `dial_timeout`.
    pub async fn connect(
        hostname: &str,
        port: u16,
        username: &str,
        auth: AuthMethod,
        server_check: ServerCheck,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let config = Arc::new(Config::default());
        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((hostname, port))
            .await
            .map_err(|e| Error::SshDial(format!("failed to resolve {hostname}:{port}: {e}")))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::SshDial(format!(
                "{hostname}:{port} did not resolve to any address"
            )));
        }

        let mut last_err = Error::SshDial(format!("could not connect to {hostname}:{port}"));
        for addr in addrs {
            let handler = TunnelHandler {
                hostname: hostname.to_string(),
                port,
                server_check: server_check.clone(),
                forwarded_tx: forwarded_tx.clone(),
            };

            match tokio::time::timeout(
                dial_timeout,
                russh::client::connect(config.clone(), addr, handler),
            )
            .await
            {
                Ok(Ok(mut handle)) => {
                    authenticate(&mut handle, username, auth).await?;
                    return Ok(Self {
                        session: Arc::new(Mutex::new(handle)),
                        username: username.to_string(),
                        address: addr,
                        forwarded_rx: std::sync::Mutex::new(Some(forwarded_rx)),
                    });
                }
                Ok(Err(e)) => last_err = Error::SshDial(format!("{addr}: {e}")),
                Err(_) => {
                    last_err = Error::SshDial(format!(
                        "{addr}: timed out after {}s",
                        dial_timeout.as_secs()
                    ))
                }
            }
        }

        Err(last_err)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Open a `direct-tcpip` channel to `host:port` on the remote side.
    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        let session = self.session.lock().await;
        session
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| Error::SshChannelOpen(format!("{host}:{port}: {e}")))
    }

    /// Ask the server to listen on `address:port` and forward inbound
    /// connections back over this session.
    pub async fn request_remote_listener(&self, address: &str, port: u16) -> Result<()> {
        let mut session = self.session.lock().await;
        session
            .tcpip_forward(address, u32::from(port))
            .await
            .map_err(|e| Error::SshListen(format!("{address}:{port}: {e}")))?;
        Ok(())
    }

    /// Cancel a previously established remote listener.
    pub async fn cancel_remote_listener(&self, address: &str, port: u16) -> Result<()> {
        let session = self.session.lock().await;
        session
            .cancel_tcpip_forward(address, u32::from(port))
            .await
            .map_err(|e| Error::SshListen(format!("cancel {address}:{port}: {e}")))?;
        Ok(())
    }

    /// Take the stream of forwarded connections. Yields `None` on second
    /// call; there is one consumer per session.
    pub fn take_forwarded_receiver(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<ForwardedConnection>> {
        self.forwarded_rx
            .lock()
            .expect("forwarded receiver lock poisoned")
            .take()
    }

    /// Run a command on the remote host and collect its stdout.
    pub async fn execute(&self, command: &str) -> Result<String> {
        let mut channel = {
            let session = self.session.lock().await;
            session
                .channel_open_session()
                .await
                .map_err(|e| Error::SshSession(e.to_string()))?
        };

        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::SshSession(e.to_string()))?;

        let mut stdout = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExitStatus { .. } => {
                    // Data may still follow the exit status; keep draining.
                }
                _ => {}
            }
        }

        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    /// Close the connection. Safe to call on an already-broken session.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await;
        session
            .disconnect(Disconnect::ByApplication, "", "")
            .await
            .map_err(Error::Ssh)
    }

    pub async fn is_closed(&self) -> bool {
        self.session.lock().await.is_closed()
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("username", &self.username)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}
