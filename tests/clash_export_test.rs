//! Exporter tests: active-tunnel selection, document layout, gating.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use drilling::models::{AuthKind, Host, HostStatus, Tunnel, TunnelKind, TunnelStatus};
use drilling::repository::{HostRepository, MemoryStore, TunnelRepository};
use drilling::{ClashExporter, Error};

fn host(name: &str) -> Host {
    Host {
        id: 0,
        name: name.to_string(),
        hostname: "10.0.0.2".to_string(),
        port: 22,
        username: "ops".to_string(),
        auth_kind: AuthKind::Password,
        password: "secret password".to_string(),
        private_key: String::new(),
        key_path: String::new(),
        passphrase: String::new(),
        description: String::new(),
        status: HostStatus::Inactive,
        last_check: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn tunnel(host_id: i64, kind: TunnelKind, port: u16) -> Tunnel {
    Tunnel {
        id: 0,
        host_id,
        name: format!("t-{port}"),
        kind,
        local_address: "127.0.0.1".to_string(),
        local_port: port,
        remote_address: if kind == TunnelKind::Dynamic {
            String::new()
        } else {
            "10.0.0.9".to_string()
        },
        remote_port: if kind == TunnelKind::Dynamic { 0 } else { 443 },
        description: String::new(),
        status: TunnelStatus::Inactive,
        auto_start: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

async fn add_tunnel(
    store: &Arc<MemoryStore>,
    host_id: i64,
    kind: TunnelKind,
    port: u16,
    status: TunnelStatus,
) -> Result<Tunnel> {
    let created = TunnelRepository::create(store.as_ref(), tunnel(host_id, kind, port)).await?;
    TunnelRepository::update_status(store.as_ref(), created.id, status).await?;
    Ok(created)
}

fn exporter(store: &Arc<MemoryStore>) -> ClashExporter {
    ClashExporter::new(store.clone(), store.clone())
}

#[tokio::test]
async fn test_no_active_socks5_is_distinct_error() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let host = HostRepository::create(store.as_ref(), host("home")).await?;

    // An inactive dynamic and an active local forward do not count
    add_tunnel(&store, host.id, TunnelKind::Dynamic, 1080, TunnelStatus::Inactive).await?;
    add_tunnel(&store, host.id, TunnelKind::LocalForward, 9000, TunnelStatus::Active).await?;

    let err = exporter(&store).generate().await.unwrap_err();
    assert!(matches!(err, Error::NoActiveSocks5));
    assert_eq!(err.to_string(), "no active SOCKS5 tunnels found");
    Ok(())
}

#[tokio::test]
async fn test_single_proxy_document() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let host = HostRepository::create(store.as_ref(), host("home")).await?;
    add_tunnel(&store, host.id, TunnelKind::Dynamic, 1080, TunnelStatus::Active).await?;

    let config = exporter(&store).generate().await?;

    assert_eq!(config.port, 7890);
    assert_eq!(config.socks_port, 7891);
    assert!(!config.allow_lan);
    assert_eq!(config.mode, "rule");
    assert_eq!(config.external_controller, "127.0.0.1:9090");

    assert_eq!(config.proxies.len(), 1);
    let proxy = &config.proxies[0];
    assert_eq!(proxy.name, "drilling-home-1080");
    assert_eq!(proxy.kind, "socks5");
    assert_eq!(proxy.server, "127.0.0.1");
    assert_eq!(proxy.port, 1080);

    // Auto url-test group plus a select group; no LoadBalance for one proxy
    assert_eq!(config.proxy_groups.len(), 2);
    assert_eq!(config.proxy_groups[0].name, "Auto");
    assert_eq!(config.proxy_groups[0].kind, "url-test");
    assert_eq!(config.proxy_groups[0].interval, Some(300));

    let select = &config.proxy_groups[1];
    assert_eq!(select.name, "Proxy");
    assert_eq!(select.kind, "select");
    assert_eq!(&select.proxies[..2], &["Auto", "DIRECT"]);
    assert!(select.proxies.contains(&"drilling-home-1080".to_string()));

    assert_eq!(config.rules.last().unwrap(), "MATCH,Proxy");
    assert!(config.rules.contains(&"GEOIP,CN,DIRECT".to_string()));
    assert!(config.dns.enable);
    assert_eq!(config.dns.fake_ip_range, "198.18.0.1/16");
    Ok(())
}

#[tokio::test]
async fn test_two_proxies_get_load_balance_group() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let home = HostRepository::create(store.as_ref(), host("home")).await?;
    let office = HostRepository::create(store.as_ref(), host("office box")).await?;

    // Inserted out of port order on purpose
    add_tunnel(&store, office.id, TunnelKind::Dynamic, 1085, TunnelStatus::Active).await?;
    add_tunnel(&store, home.id, TunnelKind::Dynamic, 1080, TunnelStatus::Active).await?;

    let config = exporter(&store).generate().await?;

    // Sorted by local port, sanitized host names
    assert_eq!(config.proxies.len(), 2);
    assert_eq!(config.proxies[0].name, "drilling-home-1080");
    assert_eq!(config.proxies[1].name, "drilling-office-box-1085");

    assert_eq!(config.proxy_groups.len(), 3);
    let select = &config.proxy_groups[1];
    assert_eq!(&select.proxies[..3], &["Auto", "LoadBalance", "DIRECT"]);

    let balance = &config.proxy_groups[2];
    assert_eq!(balance.name, "LoadBalance");
    assert_eq!(balance.kind, "load-balance");
    assert_eq!(balance.proxies.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_yaml_body_is_deterministic() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let host = HostRepository::create(store.as_ref(), host("home")).await?;
    add_tunnel(&store, host.id, TunnelKind::Dynamic, 1080, TunnelStatus::Active).await?;
    add_tunnel(&store, host.id, TunnelKind::Dynamic, 1081, TunnelStatus::Active).await?;

    let exporter = exporter(&store);
    let a = exporter.generate().await?;
    let b = exporter.generate().await?;
    assert_eq!(serde_yaml::to_string(&a)?, serde_yaml::to_string(&b)?);
    Ok(())
}

#[tokio::test]
async fn test_export_yaml_has_header_and_body() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let host = HostRepository::create(store.as_ref(), host("home")).await?;
    add_tunnel(&store, host.id, TunnelKind::Dynamic, 1080, TunnelStatus::Active).await?;

    let bytes = exporter(&store).export_yaml().await?;
    let text = String::from_utf8(bytes)?;

    assert!(text.starts_with("# Drilling Platform - Clash Configuration"));
    assert!(text.contains("# Total SOCKS5 proxies: 1"));
    assert!(text.contains("drilling-home-1080"));
    assert!(text.contains("socks-port: 7891"));
    Ok(())
}

#[tokio::test]
async fn test_socks5_status_projection() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let host = HostRepository::create(store.as_ref(), host("home")).await?;
    let created =
        add_tunnel(&store, host.id, TunnelKind::Dynamic, 1080, TunnelStatus::Active).await?;
    add_tunnel(&store, host.id, TunnelKind::Dynamic, 1081, TunnelStatus::Inactive).await?;

    let status = exporter(&store).socks5_status().await?;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].id, created.id);
    assert_eq!(status[0].local_port, 1080);
    assert_eq!(status[0].status, TunnelStatus::Active);
    Ok(())
}
