//! Proxy configuration export.

pub mod clash;

pub use clash::{ClashConfig, ClashExporter, Socks5TunnelStatus};
