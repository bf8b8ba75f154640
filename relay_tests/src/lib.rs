//! Shared helpers for the relay integration tests.

use std::time::Duration;

use relay_client::RelayClient;

/// Installs a test-writer subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Pumps the control channel until one quiet period passes.
pub async fn drain(client: &mut RelayClient) -> anyhow::Result<()> {
    while client.poll_control(Duration::from_millis(200)).await? {}
    Ok(())
}

/// Pumps the control channel until `cond` holds or the deadline passes.
pub async fn wait_for(
    client: &mut RelayClient,
    what: &str,
    cond: impl Fn(&RelayClient) -> bool,
) -> anyhow::Result<()> {
    for _ in 0..50 {
        if cond(client) {
            return Ok(());
        }
        client.poll_control(Duration::from_millis(100)).await?;
    }
    anyhow::bail!("timed out waiting for {what}")
}
