//! Server state and the link listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::link;
use crate::state::Network;
use crate::tree::LinkId;

/// A registered link socket: its send queue and its shutdown handle.
#[derive(Clone)]
pub struct LinkHandle {
    pub id: LinkId,
    /// Per-link send queue; a dedicated writer task drains it.
    pub tx: mpsc::Sender<String>,
    /// Signals the link task to stop reading and tear down.
    pub shutdown: Arc<Notify>,
    /// Identifier for logging, e.g. `inbound/10.0.0.2:7000`.
    pub label: String,
}

/// Process-wide shared state. The network singleton is mutated only
/// under its lock, from the dispatch path; sends are non-blocking.
pub struct SharedState {
    pub config: ServerConfig,
    pub net: Mutex<Network>,
    pub links: Mutex<HashMap<LinkId, LinkHandle>>,
    next_link_id: AtomicU64,
}

impl SharedState {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let sid = config
            .sid
            .parse()
            .with_context(|| format!("invalid server ID {:?}", config.sid))?;
        if !arbor_proto::valid_server_name(&config.server_name) {
            anyhow::bail!("invalid server name {:?}", config.server_name);
        }
        let mut net = Network::new(&config.server_name, sid, &config.description);
        if let Some(root) = net.tree.get_mut(net.tree.root()) {
            root.rawversion = format!("arbor-{}", env!("CARGO_PKG_VERSION"));
            root.rawbranch = format!("arbor-{}", env!("CARGO_PKG_VERSION_MAJOR"));
            root.customversion = String::new();
        }
        Ok(Arc::new(Self {
            config,
            net: Mutex::new(net),
            links: Mutex::new(HashMap::new()),
            next_link_id: AtomicU64::new(1),
        }))
    }

    /// Registers a new link socket, returning its handle.
    pub fn register_link(&self, tx: mpsc::Sender<String>, label: String) -> LinkHandle {
        let handle = LinkHandle {
            id: self.next_link_id.fetch_add(1, Ordering::Relaxed),
            tx,
            shutdown: Arc::new(Notify::new()),
            label,
        };
        self.links.lock().insert(handle.id, handle.clone());
        handle
    }

    /// Drops a link from the registry. The writer task finishes
    /// draining once every sender clone is gone.
    pub fn unregister_link(&self, id: LinkId) {
        self.links.lock().remove(&id);
    }

    pub fn link(&self, id: LinkId) -> Option<LinkHandle> {
        self.links.lock().get(&id).cloned()
    }

    /// Queues one line on a link. Lines are CR/LF-terminated here so
    /// callers never think about framing.
    pub fn send_to_link(&self, id: LinkId, line: impl Into<String>) {
        let Some(handle) = self.link(id) else { return };
        let mut line = line.into();
        line.push_str("\r\n");
        if handle.tx.try_send(line).is_err() {
            tracing::warn!(link = %handle.label, "send queue full or closed");
        }
    }

    /// Emits `ERROR :<reason>` as the last line out and tears the
    /// link down. Every fatal link error funnels through here.
    pub fn send_error_and_close(&self, id: LinkId, reason: &str) {
        if let Some(handle) = self.link(id) {
            tracing::warn!(link = %handle.label, reason, "closing link");
            self.send_to_link(id, format!("ERROR :{reason}"));
            handle.shutdown.notify_one();
        }
    }
}

/// The server: owns the configuration, binds the listener, runs the
/// autoconnect schedule.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Binds the listener and runs until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let (_, _, handle) = self.start().await?;
        handle.await?
    }

    /// Binds the listener and returns the bound address, the shared
    /// state and the accept-loop task. Used directly by tests.
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let state = SharedState::new(self.config)?;
        let listener = TcpListener::bind(&state.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", state.config.listen_addr))?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, server = %state.config.server_name, sid = %state.config.sid, "listening for server links");

        link::spawn_autoconnect(Arc::clone(&state));

        if let Some(ref tls_addr) = state.config.tls_listen_addr {
            let hook = Arc::new(link::tls::TlsHook::from_config(&state.config)?);
            let tls_listener = TcpListener::bind(tls_addr)
                .await
                .with_context(|| format!("binding {tls_addr}"))?;
            tracing::info!(addr = %tls_listener.local_addr()?, "listening for TLS server links");
            let tls_state = Arc::clone(&state);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = tls_listener.accept().await else {
                        break;
                    };
                    tracing::info!(%peer, "inbound TLS server connection");
                    let state = Arc::clone(&tls_state);
                    let hook = Arc::clone(&hook);
                    tokio::spawn(async move {
                        link::run_inbound_tls(state, hook, stream, peer).await;
                    });
                }
            });
        }

        let accept_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            loop {
                let (stream, peer) = listener.accept().await?;
                tracing::info!(%peer, "inbound server connection");
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    link::run_inbound(state, stream, peer).await;
                });
            }
        });
        Ok((addr, state, handle))
    }
}
