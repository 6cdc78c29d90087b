use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use kelda::{Contact, Dht, NodeId, UdpNetwork};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    id: NodeId,
    addr: SocketAddr,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (id_part, addr_part) = s
            .split_once('/')
            .context("bootstrap peer must be given as ID/IP:PORT")?;

        let id: NodeId = id_part.parse().context("invalid bootstrap node ID")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;

        Ok(BootstrapPeer { id, addr })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kelda")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the UDP socket to.
    #[arg(short, long, default_value = "0.0.0.0:4000")]
    bind: SocketAddr,

    /// Node ID as 64 hex characters; generated when absent.
    #[arg(short, long)]
    id: Option<NodeId>,

    /// Bootstrap peer as ID/IP:PORT; repeatable, at least one required.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER", required = true)]
    bootstrap: Vec<BootstrapPeer>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let id = args.id.unwrap_or_else(NodeId::random);
    let (network, channels) = UdpNetwork::bind(id, args.bind).await?;
    tokio::spawn(Arc::clone(&network).listen());

    let me = network.me();
    info!(id = %me.id, addr = %me.addr, "node starting");

    let bootstrap: Vec<Contact> = args
        .bootstrap
        .iter()
        .map(|peer| Contact::new(peer.id, peer.addr))
        .collect();
    let dht = Dht::new(me, &bootstrap, network, channels)?;

    let mut status = time::interval(Duration::from_secs(args.status_interval));
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting");
                break;
            }
            _ = status.tick() => {
                info!(peers = dht.known_peers(), "status");
            }
        }
    }

    Ok(())
}
