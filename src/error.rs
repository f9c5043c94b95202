//! Error types shared across the tunnel manager.

use thiserror::Error;

/// Result type alias for tunnel manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing hosts and tunnels
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing fields on a host or tunnel record
    #[error("validation error: {0}")]
    Validation(String),

    /// Name or port collision with an existing record
    #[error("conflict: {0}")]
    Conflict(String),

    /// No host with this id
    #[error("host {0} not found")]
    HostNotFound(i64),

    /// No tunnel with this id
    #[error("tunnel {0} not found")]
    TunnelNotFound(i64),

    /// A secret field is not URL-safe base64. Legacy stores kept these
    /// fields as plaintext, so callers treat this as "not ciphertext"
    /// rather than as a failure.
    #[error("value is not ciphertext")]
    CryptoFormat,

    /// Ciphertext decoded but cannot be decrypted
    #[error("crypto error: {0}")]
    CryptoIntegrity(String),

    /// TCP or SSH handshake to the remote host failed
    #[error("SSH dial failed: {0}")]
    SshDial(String),

    /// The server rejected the offered credentials
    #[error("SSH authentication failed: {0}")]
    SshAuth(String),

    /// Session channel or command execution failure
    #[error("SSH session error: {0}")]
    SshSession(String),

    /// The server refused a tcpip-forward request
    #[error("SSH remote listen failed: {0}")]
    SshListen(String),

    /// Opening a direct-tcpip channel failed
    #[error("SSH channel open failed: {0}")]
    SshChannelOpen(String),

    /// Cannot bind the local listener
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),

    /// Exporter ran with nothing to export
    #[error("no active SOCKS5 tunnels found")]
    NoActiveSocks5,

    /// The port scanner exhausted its range
    #[error("no available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    /// Lifecycle guard: the tunnel has no running handle
    #[error("tunnel is not running")]
    NotRunning,

    /// Lifecycle guard: the tunnel already has a running handle
    #[error("tunnel is already running")]
    AlreadyRunning,

    /// Per-connection dial or probe failure
    #[error("connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Underlying SSH protocol error
    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means "no such record" (HTTP 404 territory).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::HostNotFound(_) | Error::TunnelNotFound(_) | Error::NoActiveSocks5
        )
    }

    /// Whether this error is a client-side input problem (HTTP 400 territory).
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::TunnelNotFound(7).is_not_found());
        assert!(Error::NoActiveSocks5.is_not_found());
        assert!(Error::Validation("bad".into()).is_validation());
        assert!(!Error::NotRunning.is_not_found());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::NoActiveSocks5.to_string(),
            "no active SOCKS5 tunnels found"
        );
        assert_eq!(
            Error::NoAvailablePort {
                start: 1080,
                end: 1090
            }
            .to_string(),
            "no available port found in range 1080-1090"
        );
        assert_eq!(Error::NotRunning.to_string(), "tunnel is not running");
    }
}
