use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use eyre::{Context, Result};
use owlwhisper_net::{CoreController, Multiaddr, NodeConfig, PeerId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Demo daemon embedding `owlwhisper-net`: prints connect/message events to
/// stdout and broadcasts whatever it reads from stdin.
#[derive(Parser, Debug)]
#[command(name = "owlwhisperd")]
struct Args {
    /// Extra listen multiaddr, repeatable. Overrides the built-in defaults
    /// when given.
    #[arg(long = "listen")]
    listen_addresses: Vec<Multiaddr>,

    /// Extra DHT bootstrap peer, repeatable.
    #[arg(long = "bootstrap")]
    bootstrap_nodes: Vec<Multiaddr>,

    /// Rendezvous tag to advertise/find peers under.
    #[arg(long)]
    rendezvous: Option<String>,

    /// Disable mDNS local discovery.
    #[arg(long)]
    no_mdns: bool,

    /// Override the data directory (identity, peer cache, routing snapshot).
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let mut config = NodeConfig::default();
    if !args.listen_addresses.is_empty() {
        config.listen_addresses = args.listen_addresses;
    }
    config.custom_bootstrap_nodes = args.bootstrap_nodes;
    if let Some(rendezvous) = args.rendezvous {
        config.rendezvous_string = rendezvous;
    }
    config.enable_mdns = !args.no_mdns;
    config.data_dir = args.data_dir;

    let controller = CoreController::new(config);
    controller.start().await.context("failed to start owlwhisper-net controller")?;

    let peer_id = controller.my_peer_id().context("controller reported not running right after start")?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    for address in controller.listen_addresses().unwrap_or_default() {
        tracing::info!(%address, %peer_id, "listening, share as {address}/p2p/{peer_id}");
    }

    run(controller).await
}

async fn run(controller: CoreController) -> Result<()> {
    let controller = std::sync::Arc::new(controller);

    let events_task = {
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                match controller.next_event(Duration::from_secs(30)).await {
                    Ok(event) => println!("[event] {event:?}"),
                    Err(owlwhisper_net::CoreError::Timeout) => continue,
                    Err(_) => break
                }
            }
        })
    };

    let messages_task = {
        let controller = controller.clone();
        tokio::spawn(async move {
            loop {
                match controller.recv_message().await {
                    Ok(message) => {
                        println!("[message] {} -> {} bytes", message.sender, message.bytes.len());
                    }
                    Err(_) => break
                }
            }
        })
    };

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    println!("type a line to broadcast it, or `send <peer_id> <text>`, Ctrl-D to quit");
    while let Some(line) = lines.next_line().await? {
        if let Some(rest) = line.strip_prefix("send ") {
            if let Some((peer_id, text)) = rest.split_once(' ') {
                match PeerId::from_str(peer_id) {
                    Ok(peer_id) => {
                        if let Err(e) = controller.send(peer_id, text.as_bytes().to_vec().into()).await {
                            eprintln!("send failed: {e}");
                        }
                    }
                    Err(e) => eprintln!("invalid peer id: {e}")
                }
                continue;
            }
        }
        if let Err(e) = controller.broadcast(line.into_bytes().into()).await {
            eprintln!("broadcast failed: {e}");
        }
    }

    events_task.abort();
    messages_task.abort();
    controller.stop().await.context("failed to stop controller cleanly")
}
