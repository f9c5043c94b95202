//! SSH client layer.
//!
//! A thin asynchronous wrapper over russh tailored to what the tunnel
//! engine needs: authenticated connections with a dial timeout,
//! `direct-tcpip` channels for outbound dials, `tcpip-forward` listeners
//! for remote forwards, and one-shot command execution for connectivity
//! probes.

pub mod auth;
pub mod client;

pub use auth::{AuthMethod, ServerCheck};
pub use client::{ForwardedConnection, SshClient};

/// An open channel on the client's SSH session.
pub type SshChannel = russh::Channel<russh::client::Msg>;
