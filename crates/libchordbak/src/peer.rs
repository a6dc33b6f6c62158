// Wiring of one peer: transport, overlay, state, engine and the command
// surface, owned together and shut down through one cancellation token.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chord::Chord;
use libchordbak_core::constants::{CLIENT_POOL_SIZE, DEFAULT_CAPACITY, PROTOCOL_POOL_SIZE};
use libchordbak_core::spawn_utils::{spawn, spawn_with_cancel};
use libchordbak_core::PeerRef;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug_span, info};

use crate::commands::{Command, Notifier, render_state};
use crate::engine::Engine;
use crate::handler::Handler;
use crate::rpc::WireRpc;
use crate::state::PeerState;
use crate::transport::{Connection, Tls, TlsConfig, TlsDialer};

pub struct PeerOptions {
    pub listen_addr: SocketAddr,
    /// Address other peers reach us at; defaults to `listen_addr`. The
    /// peer's GUID is derived from it.
    pub advertised_addr: Option<SocketAddr>,
    /// Peer to join the ring through. `None` creates a fresh ring.
    pub bootstrap: Option<SocketAddr>,
    /// Directory holding `<guid>/<fileId>` blobs and `<guid>/state`.
    pub root: PathBuf,
    pub tls: TlsConfig,
    pub capacity: u64,
    pub client_pool_size: usize,
    pub protocol_pool_size: usize,
    /// Seed for the backup key draw; tests pin it.
    pub rng_seed: Option<u64>,
    pub cancellation_token: Option<CancellationToken>,
}

impl PeerOptions {
    pub fn new(listen_addr: SocketAddr, root: PathBuf, tls: TlsConfig) -> Self {
        PeerOptions {
            listen_addr,
            advertised_addr: None,
            bootstrap: None,
            root,
            tls,
            capacity: DEFAULT_CAPACITY,
            client_pool_size: CLIENT_POOL_SIZE,
            protocol_pool_size: PROTOCOL_POOL_SIZE,
            rng_seed: None,
            cancellation_token: None,
        }
    }
}

pub struct Peer {
    me: PeerRef,
    chord: Arc<Chord>,
    state: Arc<PeerState>,
    engine: Arc<Engine>,
    client_pool: Arc<Semaphore>,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl Peer {
    /// Builds the peer, binds its listener, joins (or creates) the ring and
    /// starts the maintenance tasks. Returns the peer and the notification
    /// stream commands answer on.
    ///
    /// Bind failures and a corrupt state file are startup-fatal.
    pub async fn new(opts: PeerOptions) -> anyhow::Result<(Arc<Peer>, UnboundedReceiver<String>)> {
        let cancel = opts.cancellation_token.unwrap_or_default();
        let advertised = opts.advertised_addr.unwrap_or(opts.listen_addr);
        let me = PeerRef::new(advertised);

        let listener = TcpListener::bind(opts.listen_addr)
            .await
            .with_context(|| format!("error binding listener on {}", opts.listen_addr))?;
        let tls = Tls::load(&opts.tls).context("error loading TLS credentials")?;

        let state = Arc::new(PeerState::load_or_create(&opts.root, me.guid, opts.capacity)?);
        let dialer: Arc<dyn crate::transport::Dialer> = Arc::new(TlsDialer::new(tls.connector));
        let chord = Chord::new(me, Arc::new(WireRpc::new(me, dialer.clone())));
        let (notifier, notifications) = Notifier::new();
        let rng = match opts.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let engine = Arc::new(Engine::new(
            me,
            chord.clone(),
            state.clone(),
            dialer,
            notifier.clone(),
            opts.protocol_pool_size,
            rng,
        ));

        let peer = Arc::new(Peer {
            me,
            chord: chord.clone(),
            state: state.clone(),
            engine: engine.clone(),
            client_pool: Arc::new(Semaphore::new(opts.client_pool_size)),
            notifier,
            cancel: cancel.clone(),
        });

        info!(me = %me, "peer starting");
        match opts.bootstrap {
            Some(addr) if addr != advertised => {
                chord
                    .join(PeerRef::new(addr))
                    .await
                    .context("error joining ring")?;
            }
            _ => {
                chord.join(me).await?;
            }
        }

        let handler = Handler {
            me,
            chord: chord.clone(),
            state,
            engine,
        };
        let acceptor = tls.acceptor;
        spawn_with_cancel(
            debug_span!("listener", me = %me.guid),
            cancel.clone(),
            async move {
                loop {
                    let (stream, addr) = listener
                        .accept()
                        .await
                        .context("error accepting connection")?;
                    let acceptor = acceptor.clone();
                    let handler = handler.clone();
                    spawn(debug_span!("conn", peer = %addr), async move {
                        let stream = acceptor
                            .accept(stream)
                            .await
                            .context("TLS accept failed")?;
                        let (read, write) = tokio::io::split(stream);
                        handler.serve(Connection::new(addr, read, write)).await
                    });
                }
            },
        );
        chord.start_maintenance(cancel);

        Ok((peer, notifications))
    }

    pub fn me(&self) -> PeerRef {
        self.me
    }

    /// Schedules a command. Never blocks the caller; the outcome arrives on
    /// the notification stream.
    pub fn dispatch(self: &Arc<Self>, cmd: Command) {
        let peer = self.clone();
        let pool = self.client_pool.clone();
        spawn(
            debug_span!("command", me = %self.me.guid, cmd = ?cmd),
            async move {
                let _permit = pool.acquire_owned().await.ok();
                peer.run(cmd).await;
                Ok(())
            },
        );
    }

    async fn run(&self, cmd: Command) {
        match cmd {
            Command::Backup { file, replication } => self.engine.backup(file, replication).await,
            Command::Restore { file } => self.engine.restore(file).await,
            Command::Delete { file } => self.engine.delete(file).await,
            Command::Reclaim { bytes } => self.engine.reclaim(bytes).await,
            Command::State => {
                let text = render_state(&self.state, &self.chord.snapshot());
                self.notifier.notify(text);
            }
            Command::Chord => self.notifier.notify(self.chord.snapshot().to_string()),
            Command::Lookup { guid } => match self.chord.find_successor(guid).await {
                Ok(p) => self.notifier.notify(format!("LOOKUP {guid} -> {p}")),
                Err(e) => self.notifier.notify(format!("LOOKUP {guid} failed: {e:#}")),
            },
        }
    }

    /// Stops the background tasks and writes the state out one last time.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.state.persist();
    }
}
