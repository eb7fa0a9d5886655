//! Minimal client: connect, join a channel and print traffic until Ctrl-C.
//!
//! ```text
//! cargo run --example connect -- irc.libera.chat 6697 ferris '#rust' [config.toml]
//! ```
//!
//! Set `RUST_LOG=slirc_net=debug` for connection details.

use std::sync::Arc;

use anyhow::{bail, Context};
use slirc_net::{Config, ConnectionManager, ConnectionRequest, Event, Status};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        bail!("usage: connect <server> <port> <nick> <channel> [config.toml]");
    }
    let config = match args.get(4) {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path))?,
        None => Config {
            tls: args[1] == "6697",
            ..Config::default()
        },
    };

    let (manager, mut events) = ConnectionManager::new(Arc::new(config));
    let req = ConnectionRequest::new(&args[0], &args[1], &args[2]);
    let channel = args[3].clone();

    let established = manager
        .connect_with_retry(&req)
        .await
        .context("could not connect")?;
    println!(
        "connected to {} via {} (tls: {})",
        established.server, established.peer, established.tls
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                manager.disconnect(Some("bye")).await;
                break;
            }
            event = events.recv() => match event {
                Some(Event::Message(msg)) => println!("← {}", msg),
                Some(Event::Status(Status::Connected)) => {
                    // Also fires after an automatic reconnect.
                    manager.send_line(&format!("JOIN {}", channel))?;
                }
                Some(Event::Status(Status::GaveUp)) => bail!("gave up reconnecting"),
                Some(Event::Status(status)) => println!("* {:?}", status),
                None => break,
            },
        }
    }
    Ok(())
}
