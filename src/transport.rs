//! # UDP Transport
//!
//! A single UDP socket carries all DHT traffic. This module provides:
//!
//! - [`Network`]: the trait seam the DHT layer is generic over, so lookup
//!   logic can be exercised against a scripted network in tests
//! - [`UdpNetwork`]: the production implementation owning the socket
//! - Session tables correlating outbound requests with inbound responses
//!
//! ## Outbound path
//!
//! Each request operation generates a random 32-byte session ID, registers a
//! oneshot result channel in the per-kind session table with a five second
//! expiry, encodes and sends the datagram, and hands the receiver back to
//! the caller. Response operations (`pong`, `send_nodes`, `send_value`) are
//! unilateral replies keyed by the inbound session ID and allocate nothing.
//!
//! ## Inbound path
//!
//! The listen fiber reads datagrams and hands each one to its own fiber for
//! decoding and dispatch: request kinds flow onto the request channels
//! consumed by the DHT's handler fibers; response kinds resolve the waiting
//! session, or are dropped with a log line when no session matches.
//!
//! ## Timeouts
//!
//! A sweeper fiber per session table delivers `None` to every waiter whose
//! session has expired, so a caller suspended on a result channel always
//! wakes: with a decoded response, or with `None` after the network timeout.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, warn};

use crate::contact::Contact;
use crate::id::{Key, NodeId};
use crate::packet::{
    self, contacts_from, node_infos, random_challenge, Challenge, Packet, Payload, SessionId,
    StoreClass, MAX_PACKET_SIZE,
};

/// How long an outbound request waits for its response.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the session sweepers look for expired sessions.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the inbound request channels.
const REQUEST_CHANNEL_SIZE: usize = 16;

/// An inbound node lookup request.
#[derive(Debug)]
pub struct FindNodesRequest {
    pub session_id: SessionId,
    pub target: NodeId,
    pub from: Contact,
}

/// An inbound value lookup request.
#[derive(Debug)]
pub struct FindValueRequest {
    pub session_id: SessionId,
    pub key: Key,
    pub from: Contact,
}

/// An inbound store request. Carries no session: stores are fire-and-forget.
#[derive(Debug)]
pub struct StoreRequest {
    pub key: Key,
    pub value: String,
    pub class: StoreClass,
    pub from: Contact,
}

/// An inbound ping awaiting its pong.
#[derive(Debug)]
pub struct PingRequest {
    pub session_id: SessionId,
    pub challenge: Challenge,
    pub from: Contact,
}

/// Decoded response to a node or value lookup.
#[derive(Clone, Debug)]
pub struct LookupResult {
    /// Contacts the callee considers closest to the requested target.
    pub closest: Vec<Contact>,
    /// The value, when the callee held one for the requested key.
    pub value: Option<String>,
}

/// Decoded response to a ping.
#[derive(Clone, Debug)]
pub struct PingResult {
    pub from: Contact,
    pub challenge: Challenge,
}

/// A waiter for one of the lookup kinds: resolved with `Some` on response,
/// `None` on timeout.
pub type LookupReceiver = oneshot::Receiver<Option<LookupResult>>;

/// A waiter for a pong.
pub type PingReceiver = oneshot::Receiver<Option<PingResult>>;

/// Receivers for the inbound request kinds, consumed by the DHT's handler
/// fibers.
pub struct RequestChannels {
    pub find_nodes: mpsc::Receiver<FindNodesRequest>,
    pub find_value: mpsc::Receiver<FindValueRequest>,
    pub store: mpsc::Receiver<StoreRequest>,
    pub ping: mpsc::Receiver<PingRequest>,
}

/// The transport operations the DHT layer depends on.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Send a ping carrying a fresh challenge. Returns the result channel
    /// and the challenge that the pong must echo.
    async fn ping(&self, addr: SocketAddr) -> Result<(PingReceiver, Challenge)>;

    /// Reply to a ping, echoing its challenge under the same session.
    async fn pong(
        &self,
        challenge: Challenge,
        session_id: SessionId,
        addr: SocketAddr,
    ) -> Result<()>;

    /// Ask a peer for its contacts closest to `target`.
    async fn find_nodes(&self, target: NodeId, addr: SocketAddr) -> Result<LookupReceiver>;

    /// Ask a peer for the value under `key`, or its closest contacts.
    async fn find_value(&self, key: Key, addr: SocketAddr) -> Result<LookupReceiver>;

    /// Place a value on a peer. Fire-and-forget.
    async fn store(
        &self,
        key: Key,
        value: &str,
        class: StoreClass,
        addr: SocketAddr,
    ) -> Result<()>;

    /// Reply to a node lookup.
    async fn send_nodes(
        &self,
        closest: &[Contact],
        session_id: SessionId,
        addr: SocketAddr,
    ) -> Result<()>;

    /// Reply to a value lookup. An empty value means "not held here".
    async fn send_value(
        &self,
        key: Key,
        value: &str,
        closest: &[Contact],
        session_id: SessionId,
        addr: SocketAddr,
    ) -> Result<()>;

    /// Signal flipped to `true` once the socket is bound and listening.
    fn ready(&self) -> watch::Receiver<bool>;
}

// ============================================================================
// Session tables
// ============================================================================

struct PendingSession<T> {
    result_tx: oneshot::Sender<Option<T>>,
    expires: Instant,
}

/// Outbound requests awaiting a response, keyed by session ID.
struct SessionTable<T> {
    entries: Mutex<HashMap<SessionId, PendingSession<T>>>,
    ttl: Duration,
}

impl<T: Send + 'static> SessionTable<T> {
    /// Create a table and start its sweeper fiber.
    fn new(ttl: Duration) -> Arc<Self> {
        let table = Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        });
        tokio::spawn(Arc::clone(&table).sweep());
        table
    }

    /// Register a waiter under `id`.
    fn insert(&self, id: SessionId, result_tx: oneshot::Sender<Option<T>>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            id,
            PendingSession {
                result_tx,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    /// Deliver a response to the waiter under `id`, removing the session.
    /// Returns false when no such session exists.
    fn resolve(&self, id: &SessionId, result: T) -> bool {
        let pending = self.entries.lock().unwrap().remove(id);
        match pending {
            Some(pending) => {
                // The waiter may have given up; nothing left to do then.
                let _ = pending.result_tx.send(Some(result));
                true
            }
            None => false,
        }
    }

    async fn sweep(self: Arc<Self>) {
        let mut ticker = interval(SESSION_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;

            let now = Instant::now();
            let expired: Vec<(SessionId, PendingSession<T>)> = {
                let mut entries = self.entries.lock().unwrap();
                let ids: Vec<SessionId> = entries
                    .iter()
                    .filter(|(_, pending)| pending.expires <= now)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| entries.remove(&id).map(|pending| (id, pending)))
                    .collect()
            };

            for (id, pending) in expired {
                debug!(session = %id, "session timed out");
                let _ = pending.result_tx.send(None);
            }
        }
    }
}

// ============================================================================
// UDP implementation
// ============================================================================

/// The production transport: one UDP socket, three session tables, four
/// request channels.
pub struct UdpNetwork {
    socket: UdpSocket,
    me: Contact,
    node_sessions: Arc<SessionTable<LookupResult>>,
    value_sessions: Arc<SessionTable<LookupResult>>,
    ping_sessions: Arc<SessionTable<PingResult>>,
    find_nodes_tx: mpsc::Sender<FindNodesRequest>,
    find_value_tx: mpsc::Sender<FindValueRequest>,
    store_tx: mpsc::Sender<StoreRequest>,
    ping_tx: mpsc::Sender<PingRequest>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl UdpNetwork {
    /// Bind the socket and build the transport. The returned
    /// [`RequestChannels`] feed the DHT's request handler fibers.
    pub async fn bind(id: NodeId, bind_addr: SocketAddr) -> Result<(Arc<Self>, RequestChannels)> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("cannot bind UDP socket to {}", bind_addr))?;
        let local_addr = socket
            .local_addr()
            .context("cannot read bound socket address")?;

        let (find_nodes_tx, find_nodes_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (find_value_tx, find_value_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (store_tx, store_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (ping_tx, ping_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (ready_tx, ready_rx) = watch::channel(false);

        let network = Arc::new(Self {
            socket,
            me: Contact::new(id, local_addr),
            node_sessions: SessionTable::new(NETWORK_TIMEOUT),
            value_sessions: SessionTable::new(NETWORK_TIMEOUT),
            ping_sessions: SessionTable::new(NETWORK_TIMEOUT),
            find_nodes_tx,
            find_value_tx,
            store_tx,
            ping_tx,
            ready_tx,
            ready_rx,
        });

        Ok((
            network,
            RequestChannels {
                find_nodes: find_nodes_rx,
                find_value: find_value_rx,
                store: store_rx,
                ping: ping_rx,
            },
        ))
    }

    /// The local contact: this node's ID and its bound socket address.
    pub fn me(&self) -> Contact {
        self.me
    }

    /// Run the listen loop. Each datagram is handled on its own fiber so a
    /// blocked request channel never stalls the socket reader.
    pub async fn listen(self: Arc<Self>) {
        debug!(addr = %self.me.addr, "listening for UDP packets");
        let _ = self.ready_tx.send(true);

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((len, addr)) => {
                    let datagram = buffer[..len].to_vec();
                    let network = Arc::clone(&self);
                    tokio::spawn(async move {
                        network.handle_datagram(datagram, addr).await;
                    });
                }
                Err(error) => {
                    warn!(%error, "error reading from UDP socket");
                }
            }
        }
    }

    async fn handle_datagram(&self, datagram: Vec<u8>, addr: SocketAddr) {
        let packet = match packet::decode(&datagram) {
            Ok(packet) => packet,
            Err(error) => {
                warn!(%addr, %error, "dropping undecodable datagram");
                return;
            }
        };

        let from = Contact::new(packet.sender_id, addr);
        let session_id = packet.session_id;

        match packet.payload {
            Payload::Ping { challenge } => {
                let request = PingRequest {
                    session_id,
                    challenge,
                    from,
                };
                if self.ping_tx.send(request).await.is_err() {
                    debug!("ping request channel closed");
                }
            }
            Payload::Pong { challenge } => {
                let result = PingResult { from, challenge };
                if !self.ping_sessions.resolve(&session_id, result) {
                    warn!(session = %session_id, "pong for unknown session");
                }
            }
            Payload::FindNode { target } => {
                let request = FindNodesRequest {
                    session_id,
                    target,
                    from,
                };
                if self.find_nodes_tx.send(request).await.is_err() {
                    debug!("find-nodes request channel closed");
                }
            }
            Payload::NodeList { nodes } => {
                let result = LookupResult {
                    closest: contacts_from(&nodes),
                    value: None,
                };
                if !self.node_sessions.resolve(&session_id, result) {
                    warn!(session = %session_id, "node list for unknown session");
                }
            }
            Payload::FindValue { key } => {
                let request = FindValueRequest {
                    session_id,
                    key,
                    from,
                };
                if self.find_value_tx.send(request).await.is_err() {
                    debug!("find-value request channel closed");
                }
            }
            Payload::Value { value, nodes, .. } => {
                let result = LookupResult {
                    closest: contacts_from(&nodes),
                    value: if value.is_empty() { None } else { Some(value) },
                };
                if !self.value_sessions.resolve(&session_id, result) {
                    warn!(session = %session_id, "value for unknown session");
                }
            }
            Payload::Store { key, value, class } => {
                let request = StoreRequest {
                    key,
                    value,
                    class,
                    from,
                };
                if self.store_tx.send(request).await.is_err() {
                    debug!("store request channel closed");
                }
            }
        }
    }

    async fn send(&self, payload: Payload, session_id: SessionId, addr: SocketAddr) -> Result<()> {
        let packet = Packet {
            session_id,
            sender_id: self.me.id,
            payload,
        };
        let bytes = packet::encode(&packet).context("cannot encode packet")?;
        self.socket
            .send_to(&bytes, addr)
            .await
            .with_context(|| format!("cannot send packet to {}", addr))?;
        Ok(())
    }
}

#[async_trait]
impl Network for UdpNetwork {
    async fn ping(&self, addr: SocketAddr) -> Result<(PingReceiver, Challenge)> {
        let session_id = SessionId::random();
        let challenge = random_challenge();

        let (result_tx, result_rx) = oneshot::channel();
        self.ping_sessions.insert(session_id, result_tx);

        self.send(Payload::Ping { challenge }, session_id, addr).await?;
        Ok((result_rx, challenge))
    }

    async fn pong(
        &self,
        challenge: Challenge,
        session_id: SessionId,
        addr: SocketAddr,
    ) -> Result<()> {
        self.send(Payload::Pong { challenge }, session_id, addr).await
    }

    async fn find_nodes(&self, target: NodeId, addr: SocketAddr) -> Result<LookupReceiver> {
        let session_id = SessionId::random();

        let (result_tx, result_rx) = oneshot::channel();
        self.node_sessions.insert(session_id, result_tx);

        self.send(Payload::FindNode { target }, session_id, addr).await?;
        Ok(result_rx)
    }

    async fn find_value(&self, key: Key, addr: SocketAddr) -> Result<LookupReceiver> {
        let session_id = SessionId::random();

        let (result_tx, result_rx) = oneshot::channel();
        self.value_sessions.insert(session_id, result_tx);

        self.send(Payload::FindValue { key }, session_id, addr).await?;
        Ok(result_rx)
    }

    async fn store(
        &self,
        key: Key,
        value: &str,
        class: StoreClass,
        addr: SocketAddr,
    ) -> Result<()> {
        let payload = Payload::Store {
            key,
            value: value.to_owned(),
            class,
        };
        self.send(payload, SessionId::random(), addr).await
    }

    async fn send_nodes(
        &self,
        closest: &[Contact],
        session_id: SessionId,
        addr: SocketAddr,
    ) -> Result<()> {
        let payload = Payload::NodeList {
            nodes: node_infos(closest),
        };
        self.send(payload, session_id, addr).await
    }

    async fn send_value(
        &self,
        key: Key,
        value: &str,
        closest: &[Contact],
        session_id: SessionId,
        addr: SocketAddr,
    ) -> Result<()> {
        let payload = Payload::Value {
            key,
            value: value.to_owned(),
            nodes: node_infos(closest),
        };
        self.send(payload, session_id, addr).await
    }

    fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }
}
