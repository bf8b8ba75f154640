use std::time::Duration;

use relay_client::RelayClient;
use relay_server::hub::bind_ephemeral;

/// Smoke test: server can bind, start, and stop without panicking.
#[tokio::test]
async fn server_starts_and_stops() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral().await?;
    server.start()?;
    server.stop().await;
    Ok(())
}

/// A disconnected client is removed from the registry promptly, so later
/// fan-out skips it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_removes_client() -> anyhow::Result<()> {
    let (mut server, cfg) = bind_ephemeral().await?;
    server.start()?;

    let client = RelayClient::connect(&cfg).await?;
    assert_eq!(server.client_count(), 1);

    drop(client);
    let mut removed = false;
    for _ in 0..40 {
        if server.client_count() == 0 {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(removed, "client not removed after disconnect");

    server.stop().await;
    Ok(())
}
