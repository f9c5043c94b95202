//! SSH tunnel fleet manager.
//!
//! Manages long-lived SSH tunnels to a set of remote hosts and exposes
//! three kinds of port forwarding: local forwards, remote forwards and
//! dynamic (SOCKS5) tunnels. Around the data plane sit a host store with
//! secrets encrypted at rest, per-tunnel connection logs and traffic
//! counters, and a Clash configuration exporter over the active SOCKS5
//! proxies.
//!
//! Persistence and the HTTP transport are external collaborators: bring a
//! [`repository`] implementation (or use the bundled in-memory one) and
//! put whatever API layer you like in front of the services.

pub mod config;
pub mod crypto;
pub mod error;
pub mod export;
pub mod hosts;
pub mod logging;
pub mod models;
pub mod repository;
pub mod socks;
pub mod ssh;
pub mod traffic;
pub mod tunnel;

pub use config::Config;
pub use error::{Error, Result};
pub use export::ClashExporter;
pub use hosts::HostService;
pub use traffic::TrafficMeter;
pub use tunnel::TunnelEngine;
