//! Interactive client shell.
//!
//! Usage:
//!   cargo run -p relay_client -- [--addr 127.0.0.1:2021] [--user <id>]
//!                                [--name <name>] [--domain <domain>]
//!
//! Commands:
//!   udp                        - Ask server to create a UDP channel
//!   user <id> <name> <domain>  - Post identity
//!   status <scene> <pos> <spd> - Post rider status
//!   list                       - Request the client roster
//!   totcp:<msg>                - Broadcast a message to scene peers
//!   toudp:<msg>                - Send a datagram to scene peers
//!   quit                       - Exit

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use relay_client::RelayClient;
use relay_shared::config::RelayConfig;
use relay_shared::profile::{StatusUpdate, UserUpdate};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> RelayConfig {
    let mut cfg = RelayConfig {
        server_addr: "127.0.0.1:2021".to_string(),
        ..Default::default()
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--user" if i + 1 < args.len() => {
                cfg.user_id = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.user_name = args[i + 1].clone();
                i += 2;
            }
            "--domain" if i + 1 < args.len() => {
                cfg.user_domain = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    cfg
}

fn print_help() {
    println!("Supported commands:");
    println!("    udp                        - Ask server to create a UDP channel");
    println!("    user <id> <name> <domain>  - Post identity");
    println!("    status <scene> <pos> <spd> - Post rider status");
    println!("    list                       - Request the client roster");
    println!("    totcp:<msg>                - Broadcast a message to scene peers");
    println!("    toudp:<msg>                - Send a datagram to scene peers");
    println!("    quit                       - Exit");
}

async fn handle_command(client: &mut RelayClient, line: &str) -> anyhow::Result<bool> {
    if line == "quit" {
        return Ok(false);
    }

    if line == "help" {
        print_help();
    } else if line == "udp" {
        println!("Asking server to create a UDP channel......");
        client.create_udp_channel().await?;
    } else if line == "list" {
        client.list_clients().await?;
    } else if let Some(msg) = line.strip_prefix("totcp:") {
        client.broadcast(msg).await?;
    } else if let Some(msg) = line.strip_prefix("toudp:") {
        if client.has_udp_channel() {
            client.send_datagram(msg.as_bytes()).await?;
        } else {
            println!("No UDP channel yet; run 'udp' first.");
        }
    } else if let Some(rest) = line.strip_prefix("user ") {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() != 3 {
            println!("Usage: user <id> <name> <domain>");
        } else {
            client
                .update_user(&UserUpdate {
                    user_id: parts[0].to_string(),
                    user_name: parts[1].to_string(),
                    user_domain: parts[2].to_string(),
                })
                .await?;
        }
    } else if let Some(rest) = line.strip_prefix("status ") {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if parts.len() != 3 {
            println!("Usage: status <scene> <pos> <speed>");
        } else {
            client
                .update_status(&StatusUpdate {
                    scene_id: parts[0].to_string(),
                    scene_pos: parts[1].to_string(),
                    speed: parts[2].to_string(),
                })
                .await?;
        }
    } else {
        client.send_raw(line).await?;
    }
    Ok(true)
}

fn drain_received(client: &mut RelayClient) {
    for status in client.rider_updates.drain(..) {
        println!(
            "[{}] {}@{} scene={} pos={} speed={}",
            status.user_id,
            status.user_name,
            status.user_domain,
            status.scene_id,
            status.scene_pos,
            status.speed
        );
    }
    if let Some(roster) = client.roster.take() {
        print!("Clients:\n{roster}");
    }
    for frame in client.broadcasts.drain(..) {
        println!("Broadcast: {}", String::from_utf8_lossy(&frame));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cfg = parse_args();
    let mut client = RelayClient::connect(&cfg).await.context("connect to relay")?;

    // Announce the configured identity right away.
    client
        .update_user(&UserUpdate {
            user_id: cfg.user_id.clone(),
            user_name: cfg.user_name.clone(),
            user_domain: cfg.user_domain.clone(),
        })
        .await?;

    // Spawn stdin reader thread.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Type 'help' to show valid commands");

    loop {
        match client.poll_control(Duration::from_millis(50)).await {
            Ok(_) => {}
            Err(e) => {
                println!("Connection lost: {e}");
                break;
            }
        }
        if let Some(payload) = client.poll_datagram(Duration::from_millis(5)).await? {
            println!("Datagram: {}", String::from_utf8_lossy(&payload));
        }
        drain_received(&mut client);

        while let Ok(line) = line_rx.try_recv() {
            if !handle_command(&mut client, &line).await? {
                info!("Client exiting");
                return Ok(());
            }
        }
    }

    Ok(())
}
