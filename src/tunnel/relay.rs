//! Bidirectional byte relay between a client connection and its dialled
//! peer.
//!
//! Two directions are multiplexed in one task: client reads are written
//! to the peer and vice versa. The relay tears the pair down as soon as
//! either direction completes (EOF, error) or the tunnel's cancellation
//! token fires; a half-closed state is not modelled. I/O errors end the
//! relay but are reported to the caller for logging, never escalated.

use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Result;

/// Buffer size for relay copies, matching typical SSH channel windows.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Byte counters for one relayed connection pair.
#[derive(Debug)]
pub struct RelayStats {
    /// Bytes moved from the client connection to the dialled peer
    pub client_to_peer: u64,
    /// Bytes moved from the dialled peer to the client connection
    pub peer_to_client: u64,
    /// Relay start time
    pub started_at: Instant,
}

impl RelayStats {
    fn new() -> Self {
        Self {
            client_to_peer: 0,
            peer_to_client: 0,
            started_at: Instant::now(),
        }
    }

    /// Total bytes moved in both directions.
    pub fn total_bytes(&self) -> u64 {
        self.client_to_peer + self.peer_to_client
    }

    pub fn duration(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// Pump bytes between `client` and `peer` until either side completes or
/// the token fires. Both endpoints are shut down on the way out.
pub async fn run<C, P>(
    mut client: C,
    mut peer: P,
    cancel_token: CancellationToken,
) -> Result<RelayStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut stats = RelayStats::new();
    let mut client_buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut peer_buf = vec![0u8; RELAY_BUFFER_SIZE];

    let outcome = loop {
        tokio::select! {
            read = client.read(&mut client_buf) => {
                match read {
                    Ok(0) => {
                        trace!("client side closed, ending relay");
                        break Ok(());
                    }
                    Ok(n) => {
                        if let Err(e) = peer.write_all(&client_buf[..n]).await {
                            break if is_disconnect(&e) { Ok(()) } else { Err(e) };
                        }
                        stats.client_to_peer += n as u64;
                    }
                    Err(e) => {
                        break if is_disconnect(&e) { Ok(()) } else { Err(e) };
                    }
                }
            }
            read = peer.read(&mut peer_buf) => {
                match read {
                    Ok(0) => {
                        trace!("peer side closed, ending relay");
                        break Ok(());
                    }
                    Ok(n) => {
                        if let Err(e) = client.write_all(&peer_buf[..n]).await {
                            break if is_disconnect(&e) { Ok(()) } else { Err(e) };
                        }
                        stats.peer_to_client += n as u64;
                    }
                    Err(e) => {
                        break if is_disconnect(&e) { Ok(()) } else { Err(e) };
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                trace!("relay cancelled");
                break Ok(());
            }
        }
    };

    // Best-effort shutdown of both endpoints; either may already be gone.
    let _ = client.shutdown().await;
    let _ = peer.shutdown().await;

    trace!(
        "relay done: {} bytes out, {} bytes in, duration {:?}",
        stats.client_to_peer,
        stats.peer_to_client,
        stats.duration()
    );

    outcome?;
    Ok(stats)
}

/// Peer-went-away errors are a normal end of the relay, not a failure.
fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
    )
}
