//! Lifecycle tests for the tunnel engine against the in-memory store.
//!
//! No SSH server is available here, so start paths are exercised up to
//! the dial and through their failure handling; the socket-level pieces
//! (port checks, health probes, port scanning) run against real
//! listeners on the loopback interface.

use anyhow::Result;
use std::sync::Arc;

use drilling::config::Timeouts;
use drilling::crypto::SecretBox;
use drilling::models::{AuthKind, Host, HostStatus, LogEvent, Tunnel, TunnelKind, TunnelStatus};
use drilling::repository::{HostRepository, MemoryStore, TunnelRepository};
use drilling::tunnel::ServiceMapping;
use drilling::{Error, HostService, TrafficMeter, TunnelEngine};

fn fast_timeouts() -> Timeouts {
    Timeouts {
        ssh_dial_secs: 2,
        health_check_secs: 1,
        accept_poll_ms: 100,
        stop_settle_ms: 10,
        restart_pause_ms: 10,
    }
}

fn setup() -> (Arc<MemoryStore>, Arc<HostService>, TunnelEngine) {
    let store = Arc::new(MemoryStore::new());
    let hosts = Arc::new(HostService::new(
        store.clone(),
        SecretBox::new("lifecycle-test-key"),
    ));
    let engine = TunnelEngine::new(
        store.clone(),
        hosts.clone(),
        Arc::new(TrafficMeter::new()),
        fast_timeouts(),
    );
    (store, hosts, engine)
}

fn unreachable_host() -> Host {
    Host {
        id: 0,
        name: "unreachable".to_string(),
        hostname: "127.0.0.1".to_string(),
        // Reserved port with nothing listening; the dial is refused
        port: 1,
        username: "ops".to_string(),
        auth_kind: AuthKind::Password,
        password: "secret password".to_string(),
        private_key: String::new(),
        key_path: String::new(),
        passphrase: String::new(),
        description: String::new(),
        status: HostStatus::Inactive,
        last_check: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

fn local_forward(host_id: i64, port: u16) -> Tunnel {
    Tunnel {
        id: 0,
        host_id,
        name: format!("lf-{port}"),
        kind: TunnelKind::LocalForward,
        local_address: "127.0.0.1".to_string(),
        local_port: port,
        remote_address: "10.0.0.5".to_string(),
        remote_port: 5432,
        description: String::new(),
        status: TunnelStatus::Inactive,
        auto_start: false,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_create_persists_inactive() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let port = free_port().await;
    let mut tunnel = local_forward(host.id, port);
    tunnel.status = TunnelStatus::Error;

    let created = engine.create(tunnel).await?;
    assert!(created.id > 0);
    assert_eq!(created.status, TunnelStatus::Inactive);
    assert_eq!(engine.status(created.id).await?, TunnelStatus::Inactive);
    Ok(())
}

#[tokio::test]
async fn test_create_rejects_duplicate_local_endpoint() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let port = free_port().await;
    engine.create(local_forward(host.id, port)).await?;

    let err = engine.create(local_forward(host.id, port)).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_create_rejects_duplicate_remote_forward_endpoint() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let mut first = local_forward(host.id, free_port().await);
    first.kind = TunnelKind::RemoteForward;
    first.remote_address = "0.0.0.0".to_string();
    first.remote_port = 9090;
    engine.create(first).await?;

    let mut second = local_forward(host.id, free_port().await);
    second.kind = TunnelKind::RemoteForward;
    second.remote_address = "0.0.0.0".to_string();
    second.remote_port = 9090;

    let err = engine.create(second).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_create_fails_when_port_is_bound() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let busy_port = listener.local_addr()?.port();

    let err = engine
        .create(local_forward(host.id, busy_port))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Bind(_, _)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_start_failure_sets_error_status_and_logs() -> Result<()> {
    let (store, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    let err = engine.start(tunnel.id).await.unwrap_err();
    assert!(matches!(err, Error::SshDial(_)), "got {err:?}");

    assert_eq!(engine.status(tunnel.id).await?, TunnelStatus::Error);

    let logs = engine.logs(tunnel.id, 0).await?;
    assert!(!logs.is_empty());
    assert_eq!(logs[0].event, LogEvent::Error);
    assert!(logs[0].message.contains("SSH connection failed"));

    // The stored record reflects the failure too
    let stored = TunnelRepository::get_by_id(store.as_ref(), tunnel.id).await?;
    assert_eq!(stored.status, TunnelStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_stop_without_handle_is_not_running() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    assert!(matches!(
        engine.stop(tunnel.id).await.unwrap_err(),
        Error::NotRunning
    ));
    assert!(matches!(
        engine.stop(424242).await.unwrap_err(),
        Error::NotRunning
    ));
    Ok(())
}

#[tokio::test]
async fn test_restart_tolerates_not_running_then_fails_like_start() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    let err = engine.restart(tunnel.id).await.unwrap_err();
    assert!(matches!(err, Error::SshDial(_)), "got {err:?}");
    assert_eq!(engine.status(tunnel.id).await?, TunnelStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_create_dynamic_tunnel_picks_socks_port() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let tunnel = engine
        .create_dynamic_tunnel(host.id, "egress".to_string(), "test".to_string(), true)
        .await?;

    assert_eq!(tunnel.kind, TunnelKind::Dynamic);
    assert_eq!(tunnel.local_address, "localhost");
    assert!(tunnel.auto_start);
    let in_preferred = (1080..=1090).contains(&tunnel.local_port);
    let in_fallback = (8080..=8090).contains(&tunnel.local_port);
    assert!(
        in_preferred || in_fallback,
        "port {} outside both scan ranges",
        tunnel.local_port
    );
    Ok(())
}

#[tokio::test]
async fn test_find_available_port() -> Result<()> {
    let (_, _, engine) = setup();

    // A held port is skipped...
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let busy = listener.local_addr()?.port();
    let err = engine
        .find_available_port(busy, busy, "127.0.0.1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoAvailablePort { .. }), "got {err:?}");

    // ...and becomes usable once released
    drop(listener);
    let found = engine.find_available_port(busy, busy, "127.0.0.1").await?;
    assert_eq!(found, busy);
    Ok(())
}

#[tokio::test]
async fn test_batch_create_is_best_effort() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let good_port = free_port().await;
    let services = vec![
        ServiceMapping {
            name: "web".to_string(),
            local_address: "127.0.0.1".to_string(),
            local_port: good_port,
            remote_address: "0.0.0.0".to_string(),
            remote_port: 18080,
            auto_start: false,
            description: String::new(),
        },
        ServiceMapping {
            // Missing remote port: fails validation
            name: "broken".to_string(),
            local_address: "127.0.0.1".to_string(),
            local_port: free_port().await,
            remote_address: "0.0.0.0".to_string(),
            remote_port: 0,
            auto_start: false,
            description: String::new(),
        },
    ];

    let outcome = engine
        .create_multiple_local_forwards(host.id, services)
        .await?;
    assert_eq!(outcome.created.len(), 1);
    assert_eq!(outcome.created[0].kind, TunnelKind::RemoteForward);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("Failed to create tunnel"));
    Ok(())
}

#[tokio::test]
async fn test_batch_create_rejects_empty_list() {
    let (_, _, engine) = setup();
    let err = engine
        .create_multiple_local_forwards(1, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");
}

#[tokio::test]
async fn test_start_auto_tunnels_survives_failures() -> Result<()> {
    let (_, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;

    let mut tunnel = local_forward(host.id, free_port().await);
    tunnel.auto_start = true;
    let tunnel = engine.create(tunnel).await?;

    // Both entries fail to dial; the sweep still completes
    engine.start_auto_tunnels().await?;
    assert_eq!(engine.status(tunnel.id).await?, TunnelStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_stop_all_on_empty_registry() -> Result<()> {
    let (_, _, engine) = setup();
    engine.stop_all().await?;
    assert!(engine.running_ids().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_delete_removes_record_and_logs() -> Result<()> {
    let (store, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    // Leave a log entry behind via a failed start
    let _ = engine.start(tunnel.id).await;
    assert!(!engine.logs(tunnel.id, 0).await?.is_empty());

    engine.delete(tunnel.id).await?;

    assert!(matches!(
        TunnelRepository::get_by_id(store.as_ref(), tunnel.id)
            .await
            .unwrap_err(),
        Error::TunnelNotFound(_)
    ));
    assert!(store.logs_for_tunnel(tunnel.id, 0).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_update_not_running_just_persists() -> Result<()> {
    let (store, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    let mut updated = tunnel.clone();
    updated.description = "updated description".to_string();
    engine.update(updated).await?;

    let stored = TunnelRepository::get_by_id(store.as_ref(), tunnel.id).await?;
    assert_eq!(stored.description, "updated description");
    // Still inactive: no stop/start cycle happened
    assert_eq!(stored.status, TunnelStatus::Inactive);
    Ok(())
}

#[tokio::test]
async fn test_reset_stale_states() -> Result<()> {
    let (store, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    TunnelRepository::update_status(store.as_ref(), tunnel.id, TunnelStatus::Active).await?;
    engine.reset_stale_states().await?;

    assert_eq!(engine.status(tunnel.id).await?, TunnelStatus::Inactive);
    Ok(())
}

#[tokio::test]
async fn test_check_service_health() -> Result<()> {
    let (_, _, engine) = setup();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    engine.check_service_health("127.0.0.1", port).await?;

    drop(listener);
    // Give the OS a moment to tear the listener down
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let err = engine
        .check_service_health("127.0.0.1", port)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_host_delete_blocked_by_tunnel_reference() -> Result<()> {
    let (store, hosts, engine) = setup();
    let host = hosts.create(unreachable_host()).await?;
    let tunnel = engine
        .create(local_forward(host.id, free_port().await))
        .await?;

    let err = hosts.delete(host.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "got {err:?}");

    engine.delete(tunnel.id).await?;
    hosts.delete(host.id).await?;
    assert!(matches!(
        HostRepository::get_by_id(store.as_ref(), host.id)
            .await
            .unwrap_err(),
        Error::HostNotFound(_)
    ));
    Ok(())
}
