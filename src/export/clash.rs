//! Clash configuration generator.
//!
//! Projects the currently-active dynamic tunnels into a Clash proxy
//! configuration: one SOCKS5 proxy per tunnel, an `Auto` url-test group,
//! a `Proxy` select group (plus a `LoadBalance` group once there are at
//! least two proxies), LAN-direct rules and a fake-ip DNS block. Output
//! is deterministic for a given tunnel set; tunnels are ordered by local
//! port.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::{Tunnel, TunnelKind, TunnelStatus};
use crate::repository::{HostRepository, TunnelRepository};

const TEST_URL: &str = "http://www.gstatic.com/generate_204";
const TEST_INTERVAL_SECS: u32 = 300;

/// Top-level Clash document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClashConfig {
    pub port: u16,
    #[serde(rename = "socks-port")]
    pub socks_port: u16,
    #[serde(rename = "allow-lan")]
    pub allow_lan: bool,
    pub mode: String,
    #[serde(rename = "log-level")]
    pub log_level: String,
    #[serde(rename = "external-ui")]
    pub external_ui: String,
    #[serde(rename = "external-controller")]
    pub external_controller: String,
    pub proxies: Vec<ClashProxy>,
    #[serde(rename = "proxy-groups")]
    pub proxy_groups: Vec<ClashProxyGroup>,
    pub rules: Vec<String>,
    pub dns: ClashDns,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClashProxy {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClashProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub proxies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClashDns {
    pub enable: bool,
    pub listen: String,
    pub nameserver: Vec<String>,
    #[serde(rename = "enhanced-mode")]
    pub enhanced_mode: String,
    #[serde(rename = "fake-ip-range")]
    pub fake_ip_range: String,
    #[serde(rename = "use-hosts")]
    pub use_hosts: bool,
    #[serde(rename = "fake-ip-filter")]
    pub fake_ip_filter: Vec<String>,
}

/// Per-tunnel summary used by the export status and preview surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5TunnelStatus {
    pub id: i64,
    pub name: String,
    pub host_id: i64,
    pub local_address: String,
    pub local_port: u16,
    pub status: TunnelStatus,
    pub created_at: chrono::DateTime<Utc>,
}

/// Generates Clash documents from the stores.
pub struct ClashExporter {
    tunnels: Arc<dyn TunnelRepository>,
    hosts: Arc<dyn HostRepository>,
}

impl ClashExporter {
    pub fn new(tunnels: Arc<dyn TunnelRepository>, hosts: Arc<dyn HostRepository>) -> Self {
        Self { tunnels, hosts }
    }

    /// Active dynamic tunnels, ordered by local port for stable output.
    pub async fn active_socks5_tunnels(&self) -> Result<Vec<Tunnel>> {
        let mut tunnels: Vec<Tunnel> = self
            .tunnels
            .list_by_status(TunnelStatus::Active)
            .await?
            .into_iter()
            .filter(|t| t.kind == TunnelKind::Dynamic)
            .collect();
        tunnels.sort_by_key(|t| t.local_port);
        Ok(tunnels)
    }

    /// Per-tunnel summaries for the export status surface.
    pub async fn socks5_status(&self) -> Result<Vec<Socks5TunnelStatus>> {
        let tunnels = self.active_socks5_tunnels().await?;
        Ok(tunnels
            .into_iter()
            .map(|t| Socks5TunnelStatus {
                id: t.id,
                name: t.name,
                host_id: t.host_id,
                local_address: t.local_address,
                local_port: t.local_port,
                status: t.status,
                created_at: t.created_at,
            })
            .collect())
    }

    /// Build the configuration document. Fails with a distinct error when
    /// no dynamic tunnel is active.
    pub async fn generate(&self) -> Result<ClashConfig> {
        let tunnels = self.active_socks5_tunnels().await?;
        if tunnels.is_empty() {
            return Err(Error::NoActiveSocks5);
        }

        let mut config = base_config();

        let mut proxy_names = Vec::with_capacity(tunnels.len());
        for tunnel in &tunnels {
            let host = match self.hosts.get_by_id(tunnel.host_id).await {
                Ok(host) => host,
                Err(_) => continue,
            };

            let proxy_name = format!(
                "drilling-{}-{}",
                sanitize_name(&host.name),
                tunnel.local_port
            );
            config.proxies.push(ClashProxy {
                name: proxy_name.clone(),
                kind: "socks5".to_string(),
                server: tunnel.local_address.clone(),
                port: tunnel.local_port,
            });
            proxy_names.push(proxy_name);
        }

        if !proxy_names.is_empty() {
            config.proxy_groups.push(ClashProxyGroup {
                name: "Auto".to_string(),
                kind: "url-test".to_string(),
                proxies: proxy_names.clone(),
                url: Some(TEST_URL.to_string()),
                interval: Some(TEST_INTERVAL_SECS),
            });

            let mut select_heads = vec!["Auto".to_string()];
            if proxy_names.len() > 1 {
                select_heads.push("LoadBalance".to_string());
            }
            select_heads.push("DIRECT".to_string());
            let mut select_proxies = select_heads;
            select_proxies.extend(proxy_names.iter().cloned());

            config.proxy_groups.push(ClashProxyGroup {
                name: "Proxy".to_string(),
                kind: "select".to_string(),
                proxies: select_proxies,
                url: None,
                interval: None,
            });

            if proxy_names.len() > 1 {
                config.proxy_groups.push(ClashProxyGroup {
                    name: "LoadBalance".to_string(),
                    kind: "load-balance".to_string(),
                    proxies: proxy_names,
                    url: Some(TEST_URL.to_string()),
                    interval: Some(TEST_INTERVAL_SECS),
                });
            }
        }

        Ok(config)
    }

    /// Render the document as YAML with a generation header.
    pub async fn export_yaml(&self) -> Result<Vec<u8>> {
        let config = self.generate().await?;

        let body = serde_yaml::to_string(&config)
            .map_err(|e| Error::Config(format!("failed to serialize Clash config: {e}")))?;

        let header = format!(
            "# Drilling Platform - Clash Configuration\n\
             # Generated at: {}\n\
             # Total SOCKS5 proxies: {}\n\
             #\n\
             # This configuration file was automatically generated by Drilling Platform\n\
             # It includes all active SOCKS5 tunnels as proxy nodes\n\
             #\n\
             # Usage:\n\
             # 1. Save this file as config.yaml in your Clash config directory\n\
             # 2. Start Clash client and select appropriate proxy group\n\
             # 3. Configure your system proxy to use Clash (HTTP: 7890, SOCKS5: 7891)\n\
             #\n\
             # External Controller: http://127.0.0.1:9090 (for Clash dashboard)\n\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            config.proxies.len()
        );

        let mut out = header.into_bytes();
        out.extend_from_slice(body.as_bytes());
        Ok(out)
    }
}

fn base_config() -> ClashConfig {
    ClashConfig {
        port: 7890,
        socks_port: 7891,
        allow_lan: false,
        mode: "rule".to_string(),
        log_level: "info".to_string(),
        external_ui: String::new(),
        external_controller: "127.0.0.1:9090".to_string(),
        proxies: Vec::new(),
        proxy_groups: Vec::new(),
        rules: vec![
            "DOMAIN-SUFFIX,local,DIRECT".to_string(),
            "DOMAIN-SUFFIX,localhost,DIRECT".to_string(),
            "DOMAIN-SUFFIX,lan,DIRECT".to_string(),
            "IP-CIDR,127.0.0.0/8,DIRECT".to_string(),
            "IP-CIDR,169.254.0.0/16,DIRECT".to_string(),
            "IP-CIDR,192.168.0.0/16,DIRECT".to_string(),
            "IP-CIDR,10.0.0.0/8,DIRECT".to_string(),
            "IP-CIDR,172.16.0.0/12,DIRECT".to_string(),
            "IP-CIDR,224.0.0.0/4,DIRECT".to_string(),
            "IP-CIDR,240.0.0.0/4,DIRECT".to_string(),
            "GEOIP,CN,DIRECT".to_string(),
            "MATCH,Proxy".to_string(),
        ],
        dns: ClashDns {
            enable: true,
            listen: "0.0.0.0:53".to_string(),
            nameserver: vec!["223.5.5.5".to_string(), "1.1.1.1".to_string()],
            enhanced_mode: "fake-ip".to_string(),
            fake_ip_range: "198.18.0.1/16".to_string(),
            use_hosts: true,
            fake_ip_filter: vec![
                "*.lan".to_string(),
                "localhost.ptlogin2.qq.com".to_string(),
                "dns.msftncsi.com".to_string(),
                "www.msftncsi.com".to_string(),
                "www.msftconnecttest.com".to_string(),
            ],
        },
    }
}

/// Reduce a host name to a safe proxy identifier: separators collapse to
/// `-`, quoting characters are dropped, runs of `-` shrink to one, and an
/// empty result becomes `proxy`. Idempotent.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            ' ' | '_' | '.' | ':' | '/' | '\\' | '|' | '*' | '?' => out.push('-'),
            '"' | '\'' | '<' | '>' => {}
            other => out.push(other),
        }
    }

    while out.contains("--") {
        out = out.replace("--", "-");
    }
    let out = out.trim_matches('-');

    if out.is_empty() {
        "proxy".to_string()
    } else {
        out.to_string()
    }
}
