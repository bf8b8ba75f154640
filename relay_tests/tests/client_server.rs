//! Full socket-based integration tests for client ↔ relay communication.

use std::time::Duration;

use relay_client::RelayClient;
use relay_server::hub::bind_ephemeral;
use relay_shared::config::RelayConfig;
use relay_shared::profile::{StatusUpdate, UserUpdate};
use relay_tests::{drain, init_tracing, wait_for};

fn status(scene: &str, pos: &str, speed: &str) -> StatusUpdate {
    StatusUpdate {
        scene_id: scene.to_string(),
        scene_pos: pos.to_string(),
        speed: speed.to_string(),
    }
}

fn user(id: &str, name: &str, domain: &str) -> UserUpdate {
    UserUpdate {
        user_id: id.to_string(),
        user_name: name.to_string(),
        user_domain: domain.to_string(),
    }
}

async fn start_server() -> anyhow::Result<(relay_server::RelayServer, RelayConfig)> {
    init_tracing();
    let (mut server, cfg) = bind_ephemeral().await?;
    server.start()?;
    Ok((server, cfg))
}

/// A broadcast reaches scene peers as the exact framed bytes and nobody
/// outside the scene.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broadcast_is_scene_scoped_and_byte_exact() -> anyhow::Result<()> {
    let (server, cfg) = start_server().await?;

    let mut a = RelayClient::connect(&cfg).await?;
    let mut b = RelayClient::connect(&cfg).await?;
    let mut c = RelayClient::connect(&cfg).await?;

    a.update_status(&status("1", "0", "0")).await?;
    b.update_status(&status("2", "0", "0")).await?;
    c.update_status(&status("1", "0", "0")).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sent = a.broadcast("hello scene one").await?;

    wait_for(&mut c, "broadcast at c", |c| !c.broadcasts.is_empty()).await?;
    assert_eq!(c.broadcasts.len(), 1);
    assert_eq!(c.broadcasts[0], sent, "relay must not rewrite broadcast bytes");

    drain(&mut b).await?;
    assert!(b.broadcasts.is_empty(), "scene 2 must not hear scene 1");
    assert!(b.rider_updates.is_empty());

    server.stop().await;
    Ok(())
}

/// An `update_status` from a scene peer arrives exactly once, carrying the
/// sender's latest identity and posted position.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_update_reaches_scene_peer_with_identity() -> anyhow::Result<()> {
    let (server, cfg) = start_server().await?;

    let mut a = RelayClient::connect(&cfg).await?;
    let mut b = RelayClient::connect(&cfg).await?;

    a.update_status(&status("7", "1", "5")).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    b.update_user(&user("u-42", "bo", "east")).await?;
    b.update_status(&status("7", "42", "28")).await?;

    wait_for(&mut a, "rider update at a", |a| !a.rider_updates.is_empty()).await?;
    drain(&mut a).await?;
    assert_eq!(a.rider_updates.len(), 1);

    let update = &a.rider_updates[0];
    assert_eq!(update.scene_id, "7");
    assert_eq!(update.scene_pos, "42");
    assert_eq!(update.speed, "28");
    assert_eq!(update.user_id, "u-42");
    assert_eq!(update.user_name, "bo");
    assert_eq!(update.user_domain, "east");

    // A's own update predates B joining scene 7, so B heard nothing.
    drain(&mut b).await?;
    assert!(b.rider_updates.is_empty());

    server.stop().await;
    Ok(())
}

/// The UDP channel grant carries a port in the allocator range, the probe
/// teaches the server our address, and datagrams fan out scene-scoped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_channel_grant_and_datagram_fanout() -> anyhow::Result<()> {
    let (server, cfg) = start_server().await?;

    let mut a = RelayClient::connect(&cfg).await?;
    let mut b = RelayClient::connect(&cfg).await?;
    let mut c = RelayClient::connect(&cfg).await?;

    a.update_status(&status("9", "0", "0")).await?;
    b.update_status(&status("9", "0", "0")).await?;
    c.update_status(&status("2", "0", "0")).await?;

    a.create_udp_channel().await?;
    b.create_udp_channel().await?;
    c.create_udp_channel().await?;

    wait_for(&mut a, "udp grant at a", |a| a.udp_port.is_some()).await?;
    wait_for(&mut b, "udp grant at b", |b| b.udp_port.is_some()).await?;
    wait_for(&mut c, "udp grant at c", |c| c.udp_port.is_some()).await?;

    let (port_a, port_b) = (a.udp_port.unwrap(), b.udp_port.unwrap());
    assert!((30001..=40000).contains(&port_a));
    assert!((30001..=40000).contains(&port_b));
    assert_ne!(port_a, port_b, "live channels must not share a port");

    // Let the discovery probes land before relying on return paths.
    tokio::time::sleep(Duration::from_millis(200)).await;

    a.send_datagram(b"pos-fine:42").await?;

    let relayed = b
        .poll_datagram(Duration::from_secs(2))
        .await?
        .expect("scene peer should receive the datagram");
    assert_eq!(relayed, b"pos-fine:42");

    let stray = c.poll_datagram(Duration::from_millis(300)).await?;
    assert!(stray.is_none(), "scene 2 must not hear scene 9 datagrams");

    server.stop().await;
    Ok(())
}

/// `list_clients` returns one line per client, in registry order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn roster_lists_clients_in_registry_order() -> anyhow::Result<()> {
    let (server, cfg) = start_server().await?;

    let mut a = RelayClient::connect(&cfg).await?;
    let mut b = RelayClient::connect(&cfg).await?;
    let _c = RelayClient::connect(&cfg).await?;

    b.update_user(&user("u-b", "billie", "west")).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    a.list_clients().await?;
    wait_for(&mut a, "roster at a", |a| a.roster.is_some()).await?;

    let roster = a.roster.take().expect("roster buffered");
    assert!(roster.ends_with('\n'));
    let lines: Vec<&str> = roster.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("1, "));
    assert!(lines[1].starts_with("2, "));
    assert!(lines[2].starts_with("3, "));

    // Profiles are embedded as JSON after the id.
    assert!(lines[1].contains(r#""user_id":"u-b""#));
    assert!(lines[1].contains(r#""user_name":"billie""#));
    assert!(lines[0].contains(r#""user_id":"N/A""#));

    server.stop().await;
    Ok(())
}

/// A second `create_udp_channel` is ignored: the port stays the same and
/// the channel keeps working.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_udp_request_is_ignored() -> anyhow::Result<()> {
    let (server, cfg) = start_server().await?;

    let mut a = RelayClient::connect(&cfg).await?;
    a.create_udp_channel().await?;
    wait_for(&mut a, "udp grant", |a| a.udp_port.is_some()).await?;
    let first = a.udp_port;

    a.create_udp_channel().await?;
    drain(&mut a).await?;
    assert_eq!(a.udp_port, first);
    assert_eq!(server.client_count(), 1);

    server.stop().await;
    Ok(())
}
