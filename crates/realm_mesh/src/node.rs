//! MeshNode: top-level coordinator for the mesh.
//!
//! [`MeshNode`] is the primary public API of realm_mesh. It manages:
//! - the TCP listener (accept incoming transports)
//! - outbound transports (connect to known peers)
//! - the HELLO / HELLO_ACK / PEER_LIST handshake
//! - flooding application messages with ttl and dedup
//! - the heartbeat and cleanup timers

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::dedup::DedupCache;
use crate::error::MeshError;
use crate::identity::{NodeId, NodeIdentity, reachable_endpoint};
use crate::liveness::{self, CleanupReport};
use crate::message::{Envelope, HelloPayload, MessageKind, PeerEndpoint};
use crate::peer::{Adoption, PeerRecord, PeerRegistry};
use crate::router::{MessageHandler, MessageRouter, Route, handler};
use crate::transport::{self, Direction, FrameReader, PeerConnection};

/// State shared by the node handle and every task it spawns.
pub(crate) struct MeshShared {
    pub(crate) node_id: NodeId,
    /// `host:port` advertised to peers; fixed once the listener is bound.
    endpoint: parking_lot::RwLock<String>,
    pub(crate) config: MeshConfig,
    pub(crate) registry: RwLock<PeerRegistry>,
    pub(crate) dedup: DedupCache,
    router: RwLock<MessageRouter>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

/// Present while the node is running.
struct Lifecycle {
    shutdown_tx: broadcast::Sender<()>,
    /// Accept loop and both timers.
    tasks: Vec<JoinHandle<()>>,
}

impl MeshShared {
    fn local_endpoint(&self) -> String {
        self.endpoint.read().clone()
    }

    fn hello(&self, kind: MessageKind) -> Result<Envelope, MeshError> {
        let payload = HelloPayload {
            endpoint: self.local_endpoint(),
        };
        Ok(Envelope::with_json(self.node_id, kind, &payload)?)
    }
}

/// A mesh node.
///
/// Cheap to clone; clones share the same node. Call
/// [`start()`](MeshNode::start) to begin accepting connections and
/// [`stop()`](MeshNode::stop) to shut everything down.
#[derive(Clone)]
pub struct MeshNode {
    shared: Arc<MeshShared>,
}

impl MeshNode {
    /// Create a node with a fresh random id.
    pub fn new(config: MeshConfig) -> Self {
        Self::with_id(NodeId::generate(), config)
    }

    /// Create a node with a fixed id.
    pub fn with_id(node_id: NodeId, config: MeshConfig) -> Self {
        let dedup = DedupCache::new(config.dedup_capacity);
        Self {
            shared: Arc::new(MeshShared {
                node_id,
                endpoint: parking_lot::RwLock::new(String::new()),
                config,
                registry: RwLock::new(PeerRegistry::new()),
                dedup,
                router: RwLock::new(MessageRouter::new()),
                lifecycle: Mutex::new(None),
            }),
        }
    }

    /// Return the node's id.
    pub fn node_id(&self) -> NodeId {
        self.shared.node_id
    }

    /// Endpoint advertised to peers. Empty until the node has started.
    pub fn local_endpoint(&self) -> String {
        self.shared.local_endpoint()
    }

    /// Return the node's full identity.
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.shared.node_id, self.shared.local_endpoint())
    }

    /// Return the node's configuration.
    pub fn config(&self) -> &MeshConfig {
        &self.shared.config
    }

    /// Whether the node is currently running.
    pub async fn is_running(&self) -> bool {
        self.shared.lifecycle.lock().await.is_some()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the node: bind the listener on `port` (0 picks a free port), then
    /// spawn the accept loop and both timers, and dial bootstrap peers.
    ///
    /// Returns the bound address without waiting for any peer.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, MeshError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(MeshError::AlreadyRunning);
        }

        let config = &self.shared.config;
        let listener = TcpListener::bind((config.listen_host.as_str(), port)).await?;
        let local_addr = listener.local_addr()?;
        *self.shared.endpoint.write() = format!("{}:{}", config.advertise_host, local_addr.port());

        let (shutdown_tx, _) = broadcast::channel(8);
        let tasks = vec![
            tokio::spawn(accept_loop(
                Arc::clone(&self.shared),
                listener,
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(liveness::heartbeat_loop(
                Arc::clone(&self.shared),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(liveness::cleanup_loop(
                Arc::clone(&self.shared),
                shutdown_tx.subscribe(),
            )),
        ];
        *lifecycle = Some(Lifecycle { shutdown_tx, tasks });
        drop(lifecycle);

        info!(
            "MeshNode {} started on {local_addr} (advertising {})",
            self.shared.node_id,
            self.local_endpoint()
        );

        for endpoint in &config.bootstrap_peers {
            let node = self.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = node.connect_to_peer(&endpoint).await {
                    warn!("Failed to connect to bootstrap peer {endpoint}: {e}");
                }
            });
        }

        Ok(local_addr)
    }

    /// Stop the node: signal shutdown, wait for the accept loop and timers,
    /// force-close every transport and mark all peers offline.
    ///
    /// A no-op on a node that is not running.
    pub async fn stop(&self) {
        let Some(lifecycle) = self.shared.lifecycle.lock().await.take() else {
            return;
        };

        let _ = lifecycle.shutdown_tx.send(());
        for task in lifecycle.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }

        let connections = {
            let mut registry = self.shared.registry.write().await;
            registry.mark_all_offline();
            registry.take_all_connections()
        };
        for conn in connections {
            debug!("Closing connection to {}", conn.remote_addr());
            conn.close();
        }

        info!("MeshNode {} stopped", self.shared.node_id);
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Open an outbound transport to `endpoint` and send HELLO.
    ///
    /// The peer appears in [`list_peers`](Self::list_peers) once its
    /// HELLO_ACK arrives. Failures are returned, never retried.
    pub async fn connect_to_peer(&self, endpoint: &str) -> Result<(), MeshError> {
        let shutdown = self.shutdown_receiver().await.ok_or(MeshError::NotRunning)?;
        let config = &self.shared.config;

        let stream = transport::dial(endpoint, config.connect_timeout).await?;
        let (conn, reader) = transport::open(
            stream,
            Direction::Outbound,
            config.outbound_queue,
            config.max_frame_bytes,
        )?;

        let hello = self.shared.hello(MessageKind::Hello)?;
        if let Err(e) = conn.send(&hello) {
            conn.close();
            return Err(e);
        }

        debug!("Sent HELLO to {endpoint}");
        spawn_read_loop(Arc::clone(&self.shared), conn, reader, shutdown);
        Ok(())
    }

    /// Snapshot of every known peer, online or not.
    pub async fn list_peers(&self) -> Vec<PeerRecord> {
        let registry = self.shared.registry.read().await;
        registry.list_all().into_iter().cloned().collect()
    }

    /// Number of peers with a live transport.
    pub async fn connected_count(&self) -> usize {
        self.shared.registry.read().await.connected_count()
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    /// Send `envelope` to every connected peer as its originator.
    ///
    /// The envelope is stamped with this node's id and its message id is
    /// recorded locally, so echoes are dropped and local handlers never see
    /// it. Returns the number of transports it was queued on.
    pub async fn broadcast(&self, mut envelope: Envelope) -> Result<usize, MeshError> {
        if !self.is_running().await {
            return Err(MeshError::NotRunning);
        }

        envelope.from_node_id = self.shared.node_id;
        self.shared.dedup.insert(envelope.message_id);

        let registry = self.shared.registry.read().await;
        let mut sent = 0;
        for (peer, conn) in registry.connections() {
            match conn.send(&envelope) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Broadcast send to {peer} failed: {e}"),
            }
        }
        debug!("Broadcast {} {} to {sent} peers", envelope.kind, envelope.message_id);
        Ok(sent)
    }

    /// Build an envelope with the configured default ttl and broadcast it.
    pub async fn broadcast_message(
        &self,
        kind: impl Into<MessageKind>,
        payload: impl Into<String>,
    ) -> Result<usize, MeshError> {
        let envelope = Envelope::new(self.shared.node_id, kind, payload)
            .with_ttl(self.shared.config.default_ttl);
        self.broadcast(envelope).await
    }

    /// Register the handler for one application verb.
    pub async fn on_message(&self, kind: impl Into<MessageKind>, handler: MessageHandler) {
        self.shared.router.write().await.register(kind.into(), handler);
    }

    /// Register the handler for application verbs without a specific one.
    pub async fn on_any_message(&self, handler: MessageHandler) {
        self.shared.router.write().await.set_default_handler(handler);
    }

    /// Register a handler for `kind` that forwards each delivery into a
    /// bounded channel. Deliveries are dropped when the channel is full.
    pub async fn subscribe(
        &self,
        kind: impl Into<MessageKind>,
        capacity: usize,
    ) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.on_message(
            kind,
            handler(move |envelope| {
                let tx = tx.clone();
                async move {
                    if tx.try_send(envelope).is_err() {
                        trace!("Subscriber full or gone, dropping delivery");
                    }
                }
            }),
        )
        .await;
        rx
    }

    /// Run one liveness / dedup cleanup pass now.
    pub async fn run_cleanup_once(&self) -> CleanupReport {
        liveness::run_cleanup(&self.shared).await
    }

    async fn shutdown_receiver(&self) -> Option<broadcast::Receiver<()>> {
        self.shared
            .lifecycle
            .lock()
            .await
            .as_ref()
            .map(|l| l.shutdown_tx.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Internal tasks
// ---------------------------------------------------------------------------

/// Accept loop: one read loop per inbound transport.
async fn accept_loop(
    shared: Arc<MeshShared>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let config = &shared.config;
                    let opened = transport::open(
                        stream,
                        Direction::Inbound,
                        config.outbound_queue,
                        config.max_frame_bytes,
                    );
                    match opened {
                        Ok((conn, reader)) => {
                            debug!("Inbound connection from {addr}");
                            spawn_read_loop(Arc::clone(&shared), conn, reader, shutdown.resubscribe());
                        }
                        Err(e) => warn!("Failed to set up inbound connection from {addr}: {e}"),
                    }
                }
                Err(e) => warn!("TCP accept failed: {e}"),
            },
            _ = shutdown.recv() => {
                debug!("Accept loop shutting down");
                break;
            }
        }
    }
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

fn spawn_read_loop(
    shared: Arc<MeshShared>,
    conn: PeerConnection,
    reader: FrameReader,
    shutdown: broadcast::Receiver<()>,
) {
    let task: BoxedTask = Box::pin(read_loop(shared, conn, reader, shutdown));
    tokio::spawn(task);
}

/// Read loop for one transport. Exits on end of stream, read error, close
/// signal or node shutdown, then releases the transport.
async fn read_loop(
    shared: Arc<MeshShared>,
    conn: PeerConnection,
    mut reader: FrameReader,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut close_rx = conn.close_signal();
    // The peer this transport belongs to, once a handshake names it.
    let mut peer: Option<NodeId> = None;
    let remote = conn.remote_addr();

    loop {
        let frame = tokio::select! {
            frame = reader.next_frame() => frame,
            _ = transport::closed(&mut close_rx) => break,
            _ = shutdown.recv() => break,
        };

        match frame {
            Ok(Some(bytes)) => match Envelope::from_slice(&bytes) {
                Ok(envelope) => handle_envelope(&shared, &conn, &mut peer, envelope).await,
                Err(e) => debug!("Dropping undecodable frame from {remote}: {e}"),
            },
            Ok(None) => {
                debug!("Connection from {remote} closed by peer");
                break;
            }
            Err(e) => {
                debug!("Read error from {remote}: {e}");
                break;
            }
        }
    }

    if let Some(node_id) = peer {
        let mut registry = shared.registry.write().await;
        if registry.detach_if(&node_id, conn.conn_id()) {
            registry.mark_offline(&node_id);
            info!("Peer {node_id} at {remote} disconnected");
        }
    }
    conn.close();
}

async fn handle_envelope(
    shared: &Arc<MeshShared>,
    conn: &PeerConnection,
    peer: &mut Option<NodeId>,
    envelope: Envelope,
) {
    let route = MessageRouter::route(envelope, &shared.dedup);

    if let (Some(node_id), false) = (*peer, matches!(route, Route::Duplicate)) {
        refresh(shared, node_id, conn).await;
    }

    match route {
        Route::Duplicate => trace!("Duplicate message from {}", conn.remote_addr()),

        Route::Malformed { kind, reason } => {
            debug!("Malformed {kind} from {}: {reason}", conn.remote_addr());
        }

        Route::Hello { envelope, hello } => {
            let from = envelope.from_node_id;
            if from == shared.node_id {
                debug!("Refusing HELLO from ourselves via {}", conn.remote_addr());
                conn.close();
                return;
            }

            let endpoint = reachable_endpoint(&hello.endpoint, conn.remote_addr());
            let Some(peers) = bind_peer(shared, conn, from, &endpoint).await else {
                return;
            };
            *peer = Some(from);
            info!("Peer {from} connected from {endpoint}");

            reply_hello_ack(shared, conn, from, peers);
        }

        Route::HelloAck { envelope, hello } => {
            let from = envelope.from_node_id;
            if from == shared.node_id {
                debug!("Dialed ourselves at {}, closing", hello.endpoint);
                conn.close();
                return;
            }

            let endpoint = reachable_endpoint(&hello.endpoint, conn.remote_addr());
            if bind_peer(shared, conn, from, &endpoint).await.is_none() {
                return;
            }
            *peer = Some(from);
            info!("Handshake with {from} at {endpoint} complete");
        }

        Route::Heartbeat(envelope) => {
            if peer.is_none() {
                shared
                    .registry
                    .write()
                    .await
                    .touch(&envelope.from_node_id, Utc::now());
            }
            let ack = Envelope::new(shared.node_id, MessageKind::HeartbeatAck, "");
            if let Err(e) = conn.send(&ack) {
                debug!("Heartbeat ack to {} failed: {e}", conn.remote_addr());
            }
        }

        Route::HeartbeatAck(envelope) => {
            trace!("Heartbeat ack from {}", envelope.from_node_id);
        }

        Route::PeerList { envelope, peers } => {
            let unknown: Vec<PeerEndpoint> = {
                let registry = shared.registry.read().await;
                peers
                    .into_iter()
                    .filter(|p| p.node_id != shared.node_id && !registry.is_known(&p.node_id))
                    .collect()
            };
            debug!(
                "PEER_LIST from {} names {} new peers",
                envelope.from_node_id,
                unknown.len()
            );

            for candidate in unknown {
                let node = MeshNode {
                    shared: Arc::clone(shared),
                };
                tokio::spawn(async move {
                    if let Err(e) = node.connect_to_peer(&candidate.endpoint).await {
                        warn!(
                            "Failed to connect to gossiped peer {} at {}: {e}",
                            candidate.node_id, candidate.endpoint
                        );
                    }
                });
            }
        }

        Route::Application { forward, deliver } => {
            if let Some(forward) = forward {
                flood(shared, *peer, &forward).await;
            }

            let target = shared.router.read().await.handler_for(&deliver.kind);
            match target {
                Some(handler) => handler(deliver).await,
                None => trace!("No handler for {}", deliver.kind),
            }
        }
    }
}

/// Map `conn` as the transport to `from` after a handshake and mark the peer
/// online. Returns the online peers to advertise back, or `None` when a live
/// transport to `from` won the tie-break and `conn` was closed instead.
async fn bind_peer(
    shared: &MeshShared,
    conn: &PeerConnection,
    from: NodeId,
    endpoint: &str,
) -> Option<Vec<PeerEndpoint>> {
    let mut registry = shared.registry.write().await;
    match registry.adopt(shared.node_id, from, conn.clone()) {
        Adoption::Adopted { replaced } => {
            if let Some(replaced) = replaced {
                debug!(
                    "Transport {} to {from} supersedes {}",
                    conn.conn_id(),
                    replaced.conn_id()
                );
                replaced.close();
            }
            registry.upsert_online(from, endpoint, Utc::now());
            Some(registry.online_endpoints(&from))
        }
        Adoption::Declined => {
            debug!(
                "Keeping existing transport to {from}, closing {} ({:?})",
                conn.conn_id(),
                conn.direction()
            );
            registry.touch(&from, Utc::now());
            conn.close();
            None
        }
    }
}

/// Reply to a HELLO on the same transport: HELLO_ACK, then our online peers.
fn reply_hello_ack(
    shared: &MeshShared,
    conn: &PeerConnection,
    to: NodeId,
    peers: Vec<PeerEndpoint>,
) {
    let replies = shared.hello(MessageKind::HelloAck).and_then(|ack| {
        let list = Envelope::with_json(shared.node_id, MessageKind::PeerList, &peers)?;
        Ok([ack, list])
    });

    match replies {
        Ok(replies) => {
            for reply in &replies {
                if let Err(e) = conn.send(reply) {
                    warn!("Failed to send {} to {to}: {e}", reply.kind);
                }
            }
        }
        Err(e) => warn!("Failed to build handshake reply for {to}: {e}"),
    }
}

/// Refresh a bound peer's `last_seen`, and re-map this transport if the
/// peer lost its mapping (for example after a concurrent connect).
async fn refresh(shared: &MeshShared, node_id: NodeId, conn: &PeerConnection) {
    let mut registry = shared.registry.write().await;
    registry.touch(&node_id, Utc::now());
    if registry.connection(&node_id).is_none() && !conn.is_closed() {
        registry.attach(node_id, conn.clone());
        registry.mark_online(&node_id);
        debug!("Re-attached transport for {node_id}");
    }
}

/// Send `envelope` to every mapped transport except the one it arrived on and
/// the originator's.
async fn flood(shared: &MeshShared, arrived_from: Option<NodeId>, envelope: &Envelope) {
    let registry = shared.registry.read().await;
    let mut forwarded = 0;
    for (node_id, conn) in registry.connections() {
        if Some(*node_id) == arrived_from || *node_id == envelope.from_node_id {
            continue;
        }
        match conn.send(envelope) {
            Ok(()) => forwarded += 1,
            Err(e) => debug!("Forward to {node_id} failed: {e}"),
        }
    }
    trace!(
        "Forwarded {} {} (ttl {}) to {forwarded} peers",
        envelope.kind, envelope.message_id, envelope.ttl
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
