//! Embedded SOCKS5 server for dynamic tunnels.
//!
//! Implements the v5 handshake and `CONNECT` command of RFC 1928 for one
//! inbound connection at a time; the accept loop of a dynamic tunnel
//! hands each connection here. Outbound dials go through an injected
//! [`Dialer`], which in production opens a `direct-tcpip` channel on the
//! tunnel's SSH session.
//!
//! `BIND` and `UDP ASSOCIATE` are rejected, as is every authentication
//! method except "no authentication required".

use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ssh::SshClient;
use crate::tunnel::relay::{self, RelayStats};

pub const SOCKS5_VERSION: u8 = 0x05;

// Authentication methods
pub const AUTH_METHOD_NO_AUTH: u8 = 0x00;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

// Commands
pub const CMD_CONNECT: u8 = 0x01;

// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// Reply codes
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Scratch space for handshake and request parsing; domains are at most
/// 255 bytes so this covers every message.
const SCRATCH_BUFFER_SIZE: usize = 256;

/// A bidirectional byte stream to a dialled destination.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

pub type BoxedStream = Box<dyn Duplex>;

/// Opens connections to CONNECT destinations on behalf of the proxy.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

#[async_trait]
impl Dialer for SshClient {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let channel = self.open_direct_tcpip(host, port).await?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Receives the relayed byte counts of one finished proxy connection.
pub trait TrafficLogger: Send + Sync {
    /// `bytes_in` travelled remote→client, `bytes_out` client→remote.
    fn log_traffic(&self, bytes_in: u64, bytes_out: u64);
}

/// SOCKS5 proxy bound to one SSH-backed dialer.
pub struct Socks5Server {
    dialer: std::sync::Arc<dyn Dialer>,
    traffic: Option<std::sync::Arc<dyn TrafficLogger>>,
}

impl Socks5Server {
    pub fn new(dialer: std::sync::Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            traffic: None,
        }
    }

    pub fn with_traffic_logger(
        dialer: std::sync::Arc<dyn Dialer>,
        traffic: std::sync::Arc<dyn TrafficLogger>,
    ) -> Self {
        Self {
            dialer,
            traffic: Some(traffic),
        }
    }

    /// Serve one inbound connection end-to-end: handshake, CONNECT,
    /// relay. Returns the relay's byte counters.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Result<RelayStats> {
        self.handle_stream(stream, peer_addr.to_string(), cancel_token)
            .await
    }

    /// Transport-generic body of [`Self::handle_connection`].
    pub(crate) async fn handle_stream<S>(
        &self,
        mut stream: S,
        peer: String,
        cancel_token: CancellationToken,
    ) -> Result<RelayStats>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.negotiate_auth(&mut stream, &peer).await?;
        let (host, port) = self.read_request(&mut stream, &peer).await?;

        debug!("SOCKS5 CONNECT to {}:{} from {}", host, port, peer);

        let remote = match self.dialer.dial(&host, port).await {
            Ok(remote) => remote,
            Err(e) => {
                // VER REP RSV ATYP BND.ADDR(4) BND.PORT(2)
                let reply = [
                    SOCKS5_VERSION,
                    REP_HOST_UNREACHABLE,
                    0x00,
                    ATYP_IPV4,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                ];
                let _ = stream.write_all(&reply).await;
                return Err(Error::Connection(format!(
                    "failed to connect to {host}:{port}: {e}"
                )));
            }
        };

        // Bound address is not reported; reply 0.0.0.0:0.
        let reply = [
            SOCKS5_VERSION,
            REP_SUCCESS,
            0x00,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ];
        stream.write_all(&reply).await?;

        debug!("SOCKS5 tunnel established: {} -> {}:{}", peer, host, port);

        let stats = relay::run(stream, remote, cancel_token).await?;

        if let Some(traffic) = &self.traffic {
            traffic.log_traffic(stats.peer_to_client, stats.client_to_peer);
        }

        Ok(stats)
    }

    /// Method-selection phase: VER NMETHODS METHODS...
    async fn negotiate_auth<S>(&self, stream: &mut S, peer: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::Connection(format!(
                "invalid SOCKS version {} from {peer}",
                header[0]
            )));
        }

        let nmethods = header[1] as usize;
        let mut methods = [0u8; SCRATCH_BUFFER_SIZE];
        stream.read_exact(&mut methods[..nmethods]).await?;

        let no_auth_offered = methods[..nmethods].contains(&AUTH_METHOD_NO_AUTH);
        let selected = if no_auth_offered {
            AUTH_METHOD_NO_AUTH
        } else {
            AUTH_METHOD_NO_ACCEPTABLE
        };

        stream.write_all(&[SOCKS5_VERSION, selected]).await?;

        if !no_auth_offered {
            return Err(Error::Connection(format!(
                "no acceptable authentication method from {peer}"
            )));
        }
        Ok(())
    }

    /// Request phase: VER CMD RSV ATYP DST.ADDR DST.PORT. Returns the
    /// destination to dial.
    async fn read_request<S>(&self, stream: &mut S, peer: &str) -> Result<(String, u16)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(Error::Connection(format!(
                "invalid SOCKS request version {} from {peer}",
                header[0]
            )));
        }

        if header[1] != CMD_CONNECT {
            let reply = [
                SOCKS5_VERSION,
                REP_COMMAND_NOT_SUPPORTED,
                0x00,
                ATYP_IPV4,
                0,
                0,
                0,
                0,
                0,
                0,
            ];
            stream.write_all(&reply).await?;
            return Err(Error::Connection(format!(
                "unsupported SOCKS command {} from {peer}",
                header[1]
            )));
        }

        let host = match header[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                Ipv4Addr::from(addr).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = [0u8; SCRATCH_BUFFER_SIZE];
                let domain_len = len[0] as usize;
                stream.read_exact(&mut domain[..domain_len]).await?;
                String::from_utf8_lossy(&domain[..domain_len]).to_string()
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                Ipv6Addr::from(addr).to_string()
            }
            other => {
                let reply = [
                    SOCKS5_VERSION,
                    REP_ADDRESS_NOT_SUPPORTED,
                    0x00,
                    ATYP_IPV4,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                ];
                stream.write_all(&reply).await?;
                return Err(Error::Connection(format!(
                    "unsupported address type {other} from {peer}"
                )));
            }
        };

        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        Ok((host, u16::from_be_bytes(port)))
    }
}
