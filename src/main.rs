use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use arboard::Clipboard;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use openclipboard_node::{ClipboardCapability, DiscoverySink, EventSink, Node, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "openclipboard", about = "Local-first LAN clipboard sync")]
struct Args {
    /// Directory holding identity.json and trust.json
    #[arg(long, env = "OPENCLIPBOARD_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the clipboard mesh node
    Run {
        /// Device name shown to peers
        #[arg(short, long, env = "OPENCLIPBOARD_NAME")]
        name: Option<String>,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Clipboard poll interval in milliseconds
        #[arg(long, default_value = "250")]
        poll_ms: u64,

        /// Accept the next inbound pairing attempt for this many seconds
        #[arg(long)]
        pair_window: Option<u64>,
    },
    /// Show this device's pairing payload, or scan another device's
    Pair {
        #[arg(short, long, env = "OPENCLIPBOARD_NAME")]
        name: Option<String>,

        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Scan a payload displayed by another device instead of showing ours
        #[arg(long)]
        scan: Option<String>,
    },
    /// Manage trusted peers
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },
}

#[derive(Subcommand)]
enum TrustAction {
    /// List trusted peers
    List,
    /// Remove one trusted peer
    Remove { peer_id: String },
    /// Remove every trusted peer
    Clear,
}

/// Arboard-backed clipboard capability.
struct ArboardClipboard {
    inner: Mutex<Clipboard>,
}

impl ArboardClipboard {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            inner: Mutex::new(Clipboard::new()?),
        })
    }
}

impl ClipboardCapability for ArboardClipboard {
    fn read_text(&self) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        let mut clipboard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match clipboard.get_text() {
            Ok(text) => Ok(Some(text)),
            Err(arboard::Error::ContentNotAvailable) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    fn write_text(&self, text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut clipboard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        clipboard.set_text(text)?;
        Ok(())
    }
}

/// Sink that narrates node events into the log.
struct LogSink;

impl EventSink for LogSink {
    fn on_clipboard_text(&self, peer_id: &str, text: &str, _ts_ms: u64) {
        info!(peer = %peer_id, len = text.len(), "clipboard updated from peer");
    }

    fn on_peer_connected(&self, peer_id: &str) {
        info!(peer = %peer_id, "peer connected");
    }

    fn on_peer_disconnected(&self, peer_id: &str) {
        info!(peer = %peer_id, "peer disconnected");
    }

    fn on_error(&self, message: &str) {
        error!("{message}");
    }
}

impl DiscoverySink for LogSink {
    fn on_peer_discovered(&self, peer_id: &str, name: &str, addr: SocketAddr) {
        info!(peer = %peer_id, %name, %addr, "peer nearby");
    }

    fn on_peer_lost(&self, peer_id: &str) {
        info!(peer = %peer_id, "peer left");
    }
}

fn state_dir(args: &Args) -> PathBuf {
    args.state_dir.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("openclipboard")
    })
}

fn device_name(name: Option<String>) -> String {
    name.or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "openclipboard".to_string())
}

fn lan_addrs(port: u16) -> Vec<String> {
    match local_ip_address::local_ip() {
        Ok(ip) => vec![format!("{ip}:{port}")],
        Err(e) => {
            error!("could not determine local ip: {e}");
            Vec::new()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("openclipboard_node=info".parse()?)
                .add_directive("openclipboard=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let dir = state_dir(&args);
    let node =
        Node::new(dir.join("identity.json"), dir.join("trust.json")).context("opening node state")?;

    match args.command {
        Command::Run {
            name,
            port,
            poll_ms,
            pair_window,
        } => {
            let name = device_name(name);
            info!(id = %node.peer_id(), %name, %port, "starting openclipboard");

            let clipboard = Arc::new(ArboardClipboard::new()?);
            node.start_mesh(
                port,
                &name,
                Arc::new(LogSink),
                clipboard,
                Duration::from_millis(poll_ms),
            )
            .await?;
            node.start_discovery(&name, Arc::new(LogSink)).await?;

            if let Some(secs) = pair_window {
                node.enable_qr_pairing_listener_for(Duration::from_secs(secs));
                println!("pairing payload (valid {secs}s):");
                println!(
                    "{}",
                    node.create_pairing_payload(lan_addrs(port)).to_qr_string()
                );
            }

            tokio::signal::ctrl_c().await?;
            node.stop().await;
        }
        Command::Pair { name, port, scan } => {
            let name = device_name(name);
            match scan {
                Some(qr) => {
                    let peer_id = node.pair_via_qr(&qr).await?;
                    println!("paired with {peer_id}");
                }
                None => {
                    let clipboard = Arc::new(ArboardClipboard::new()?);
                    node.start_mesh(
                        port,
                        &name,
                        Arc::new(LogSink),
                        clipboard,
                        Duration::from_millis(250),
                    )
                    .await?;
                    node.enable_qr_pairing_listener();

                    println!("scan this on the other device:");
                    println!(
                        "{}",
                        node.create_pairing_payload(lan_addrs(port)).to_qr_string()
                    );
                    println!("waiting for the peer to connect (ctrl-c to quit)...");

                    tokio::signal::ctrl_c().await?;
                    node.stop().await;
                }
            }
        }
        Command::Trust { action } => match action {
            TrustAction::List => {
                for record in node.trusted_peers() {
                    println!(
                        "{}  {}  (added {})",
                        record.peer_id, record.display_name, record.created_at
                    );
                }
            }
            TrustAction::Remove { peer_id } => {
                if node.trust_store().remove(&peer_id)? {
                    println!("removed {peer_id}");
                } else {
                    println!("{peer_id} was not trusted");
                }
            }
            TrustAction::Clear => {
                node.trust_store().clear()?;
                println!("trust store cleared");
            }
        },
    }

    Ok(())
}
