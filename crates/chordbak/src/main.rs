use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use libchordbak::{Command, Peer, PeerOptions, TlsConfig};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A peer of the chordbak backup ring. Commands are read line by line from
/// stdin; notifications are printed to stdout as they arrive.
#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// Address to listen on for peer connections.
    #[arg(long, env = "CHORDBAK_LISTEN")]
    listen: SocketAddr,

    /// Address other peers reach us at, when it differs from --listen
    /// (e.g. behind NAT). The peer's ring id derives from it.
    #[arg(long, env = "CHORDBAK_ADVERTISE")]
    advertise: Option<SocketAddr>,

    /// Peer to join an existing ring through. Omit to start a new ring.
    #[arg(long, env = "CHORDBAK_BOOTSTRAP")]
    bootstrap: Option<SocketAddr>,

    /// Directory for stored blobs and the state file.
    #[arg(long, default_value = "./chordbak-data", env = "CHORDBAK_ROOT")]
    root: PathBuf,

    /// PEM certificate presented to other peers.
    #[arg(long, env = "CHORDBAK_CERT")]
    cert: PathBuf,

    /// PEM private key matching --cert.
    #[arg(long, env = "CHORDBAK_KEY")]
    key: PathBuf,

    /// PEM CA bundle every ring member is signed by.
    #[arg(long, env = "CHORDBAK_CA")]
    ca: PathBuf,

    /// Storage capacity granted to other peers, in bytes.
    #[arg(long, env = "CHORDBAK_CAPACITY")]
    capacity: Option<u64>,

    /// Concurrently executing client commands.
    #[arg(long, env = "CHORDBAK_CLIENT_POOL")]
    client_pool: Option<usize>,

    /// Concurrently executing per-target protocol tasks.
    #[arg(long, env = "CHORDBAK_PROTOCOL_POOL")]
    protocol_pool: Option<usize>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,libchordbak=info".into()),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    init_logging();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("error creating tokio runtime")?
        .block_on(async_main(opts))
}

async fn async_main(opts: Opts) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let mut peer_opts = PeerOptions::new(
        opts.listen,
        opts.root,
        TlsConfig {
            cert: opts.cert,
            key: opts.key,
            ca: opts.ca,
        },
    );
    peer_opts.advertised_addr = opts.advertise;
    peer_opts.bootstrap = opts.bootstrap;
    peer_opts.cancellation_token = Some(cancel.clone());
    if let Some(c) = opts.capacity {
        peer_opts.capacity = c;
    }
    if let Some(n) = opts.client_pool {
        peer_opts.client_pool_size = n;
    }
    if let Some(n) = opts.protocol_pool {
        peer_opts.protocol_pool_size = n;
    }

    let (peer, mut notifications) = Peer::new(peer_opts).await?;
    info!(me = %peer.me(), "peer running; type commands on stdin (BACKUP/RESTORE/DELETE/RECLAIM/STATE/CHORD/LOOKUP)");

    let printer = tokio::spawn(async move {
        while let Some(msg) = notifications.recv().await {
            println!("{msg}");
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(l)) => l,
                    Ok(None) => break,
                    Err(e) => {
                        error!("error reading stdin: {e:#}");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(cmd) => peer.dispatch(cmd),
                    Err(e) => warn!("{e:#}"),
                }
            }
        }
    }

    peer.shutdown();
    printer.abort();
    Ok(())
}
