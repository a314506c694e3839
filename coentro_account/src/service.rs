//! Account service
//!
//! Exposes an [`AccountCache`] to IPC clients. Every connected peer can send
//! requests and receives every event the coordinator produces.
//!
//! The daemon process embedding the service supplies its [`AccountDaemon`]
//! implementation and drives the service from its entry point:
//!
//! ```no_run
//! # use coentro_account::{AccountService, DaemonHandle};
//! # use shared_utils::{logging::init_logging_from_config, Config};
//! # async fn run(daemon: DaemonHandle) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_default(Config::default_path())?;
//! let _guard = init_logging_from_config(&config);
//!
//! let service = AccountService::from_config(daemon, &config);
//! service.run_until_signal(&config.ipc).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`AccountDaemon`]: crate::daemon::AccountDaemon

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use coentro_ipc::{
    Event, EventWriter, IpcConnection, IpcListener, RequestReader, TransportOptions,
};
use shared_utils::{AccountConfig, Config, IpcConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::AccountCache;
use crate::daemon::DaemonHandle;
use crate::error::AccountResult;
use crate::sink::{PeerEvents, PeerId};

/// Transport limits configured for the account socket.
pub fn transport_options(ipc: &IpcConfig) -> TransportOptions {
    TransportOptions {
        write_timeout: ipc.write_timeout(),
        max_frame_bytes: ipc.max_frame_bytes,
    }
}

/// Account service serving an [`AccountCache`] over IPC.
pub struct AccountService {
    peers: Arc<PeerEvents>,
    cache: Arc<AccountCache>,
}

impl AccountService {
    /// Create the service and its coordinator. Must be called inside a tokio
    /// runtime.
    pub fn new(daemon: DaemonHandle, config: &AccountConfig) -> Self {
        let peers = Arc::new(PeerEvents::new());
        let cache = Arc::new(AccountCache::new(daemon, peers.clone(), config));
        Self { peers, cache }
    }

    pub fn from_config(daemon: DaemonHandle, config: &Config) -> Self {
        Self::new(daemon, &config.account)
    }

    pub fn cache(&self) -> &Arc<AccountCache> {
        &self.cache
    }

    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    /// Bind `socket_path` and serve until `shutdown` fires.
    pub async fn serve_path<P: AsRef<Path>>(
        &self,
        socket_path: P,
        options: TransportOptions,
        shutdown: CancellationToken,
    ) -> AccountResult<()> {
        let listener = IpcListener::bind(socket_path, options)?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve on the configured socket until `stop` completes.
    pub async fn run_until<F>(&self, ipc: &IpcConfig, stop: F) -> AccountResult<()>
    where
        F: Future<Output = ()>,
    {
        let listener = IpcListener::bind(&ipc.socket_path, transport_options(ipc))?;
        let shutdown = CancellationToken::new();

        let serve = self.serve(listener, shutdown.clone());
        tokio::pin!(serve);
        tokio::select! {
            _ = &mut serve => return Ok(()),
            _ = stop => {}
        }

        shutdown.cancel();
        serve.await;
        Ok(())
    }

    /// Serve on the configured socket until SIGINT or SIGTERM.
    pub async fn run_until_signal(&self, ipc: &IpcConfig) -> AccountResult<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        self.run_until(ipc, async move {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            }
        })
        .await
    }

    /// Accept peers on `listener` until `shutdown` fires, then shut the
    /// coordinator down.
    pub async fn serve(&self, listener: IpcListener, shutdown: CancellationToken) {
        info!(socket = %listener.socket_path().display(), "Account service listening");
        let mut peer_tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping account service");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(connection) => {
                        peer_tasks.spawn(serve_peer(
                            connection,
                            Arc::clone(&self.peers),
                            Arc::clone(&self.cache),
                        ));
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                Some(finished) = peer_tasks.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!(error = %e, "Peer task panicked");
                        }
                    }
                }
            }
        }

        // Aborting a peer task drops its guard, which closes the connection.
        peer_tasks.shutdown().await;
        self.cache.shutdown();
        self.cache.wait_for_shutdown().await;
        info!("Account service stopped");
    }
}

/// Per-peer resources released when the peer task ends, including when it is
/// aborted by service shutdown.
struct PeerGuard {
    peer: PeerId,
    peers: Arc<PeerEvents>,
    writer: JoinHandle<()>,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.peers.unregister(self.peer);
        // Dropping the writer's half closes the peer's event stream.
        self.writer.abort();
        info!(peer = ?self.peer, "Account client disconnected");
    }
}

async fn serve_peer(connection: IpcConnection, peers: Arc<PeerEvents>, cache: Arc<AccountCache>) {
    let (peer, events) = peers.register();
    info!(peer = ?peer, "Accepted account client");
    let (reader, writer) = connection.into_split();

    let mut guard = PeerGuard {
        peer,
        peers,
        writer: tokio::spawn(write_events(writer, events, peer)),
    };
    tokio::select! {
        _ = read_requests(reader, &cache, peer) => {}
        _ = &mut guard.writer => debug!(peer = ?peer, "Event writer stopped first"),
    }
}

async fn read_requests(mut reader: RequestReader, cache: &AccountCache, peer: PeerId) {
    loop {
        match reader.next_request().await {
            Ok(Some(request)) => {
                debug!(peer = ?peer, ?request, "Received request");
                cache.handle_request(request);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(peer = ?peer, error = %e, "Failed to read request");
                break;
            }
        }
    }
}

async fn write_events(
    mut writer: EventWriter,
    mut events: mpsc::UnboundedReceiver<Event>,
    peer: PeerId,
) {
    while let Some(event) = events.recv().await {
        if let Err(e) = writer.send_event(&event).await {
            warn!(peer = ?peer, error = %e, "Failed to deliver event");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(peer = ?peer, error = %e, "Failed to close event stream");
    }
}
