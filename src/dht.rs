//! # DHT Node
//!
//! The façade tying routing, storage and transport together. Public
//! operations:
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `put(value)` | Store a value in the network, returning its content key |
//! | `get(key)` | Retrieve a value via iterative lookup |
//! | `ping(id)` | Challenge a known contact and verify its echo |
//! | `forget(key)` | Stop republishing a previously published value |
//! | `join()` | Bootstrap into the overlay |
//!
//! ## The walk
//!
//! Both node and value lookups run the same iterative tightening loop,
//! parameterised by a call strategy (`target`, `dispatch`, `observe`). Each
//! iteration queries up to α un-contacted candidates from the shortlist,
//! folds their answers back in (in arrival order), and stops once the
//! closest known contact no longer improves: first with one final round
//! covering the whole shortlist, then for good.
//!
//! ## Fibers
//!
//! `Dht` is a cheap-to-clone handle. Construction spawns one fiber per
//! inbound request kind, plus the bucket refresh, republish and replicate
//! handlers and the bootstrap fiber that joins once the transport reports
//! ready.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::contact::Contact;
use crate::id::{ids_with_prefix, random_id_in_bucket, truncate_value, Key, NodeId};
use crate::packet::{Challenge, StoreClass};
use crate::routing::{RoutingTable, K};
use crate::store::{Database, StoreError};
use crate::transport::{
    FindNodesRequest, FindValueRequest, LookupReceiver, LookupResult, Network, PingRequest,
    RequestChannels, StoreRequest,
};

/// Concurrency width of a lookup iteration.
pub const ALPHA: usize = 3;

/// Time after which a remote item expires.
const T_EXPIRE: Duration = Duration::from_secs(86410);

/// Interval between replication events for remote items.
const T_REPLICATE: Duration = Duration::from_secs(3600);

/// Time after which this node republishes its own items.
const T_REPUBLISH: Duration = Duration::from_secs(86400);

/// Bucket staleness threshold triggering a refresh lookup.
const T_REFRESH: Duration = Duration::from_secs(3600);

/// Back-off between bootstrap attempts.
const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Lookup termination failures surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// The routing table yielded no candidates to start a walk from.
    EmptyRoutingTable,
    /// Every candidate was contacted and none responded.
    NoCandidatesResponded,
    /// The walk converged without finding a value.
    NotFound,
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::EmptyRoutingTable => f.write_str("empty routing table"),
            LookupError::NoCandidatesResponded => f.write_str("no candidates responded"),
            LookupError::NotFound => f.write_str("value not found"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Operational parameters. The defaults are the protocol constants; tests
/// shrink the intervals.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    pub alpha: usize,
    pub k: usize,
    pub t_expire: Duration,
    pub t_replicate: Duration,
    pub t_republish: Duration,
    pub t_refresh: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            alpha: ALPHA,
            k: K,
            t_expire: T_EXPIRE,
            t_replicate: T_REPLICATE,
            t_republish: T_REPUBLISH,
            t_refresh: T_REFRESH,
        }
    }
}

// ============================================================================
// Call strategies
// ============================================================================

/// One kind of walk: what to approach, how to call a peer, and what to make
/// of each answer. `observe` runs in response-arrival order and may cut the
/// current response batch short.
#[async_trait]
trait Call<N: Network>: Send {
    fn target(&self) -> NodeId;

    async fn dispatch(&self, nw: &N, addr: SocketAddr) -> Result<LookupReceiver>;

    fn observe(&mut self, result: &LookupResult, callee: &Contact) -> bool;
}

/// Node lookup: walk to convergence, never stop early.
struct FindNodesCall {
    target: NodeId,
}

#[async_trait]
impl<N: Network> Call<N> for FindNodesCall {
    fn target(&self) -> NodeId {
        self.target
    }

    async fn dispatch(&self, nw: &N, addr: SocketAddr) -> Result<LookupReceiver> {
        nw.find_nodes(self.target, addr).await
    }

    fn observe(&mut self, _result: &LookupResult, _callee: &Contact) -> bool {
        false
    }
}

/// Value lookup: remember the first non-empty value and its sender.
struct FindValueCall {
    key: Key,
    found: Option<(String, NodeId)>,
}

#[async_trait]
impl<N: Network> Call<N> for FindValueCall {
    fn target(&self) -> NodeId {
        NodeId::from(self.key)
    }

    async fn dispatch(&self, nw: &N, addr: SocketAddr) -> Result<LookupReceiver> {
        nw.find_value(self.key, addr).await
    }

    fn observe(&mut self, result: &LookupResult, callee: &Contact) -> bool {
        match &result.value {
            Some(value) => {
                self.found = Some((value.clone(), callee.id));
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// The node
// ============================================================================

/// Handle to a running DHT node. Cheap to clone; all state is shared.
pub struct Dht<N: Network> {
    me: Contact,
    rt: Arc<RoutingTable>,
    nw: Arc<N>,
    db: Arc<Database>,
    config: DhtConfig,
}

impl<N: Network> Clone for Dht<N> {
    fn clone(&self) -> Self {
        Self {
            me: self.me,
            rt: Arc::clone(&self.rt),
            nw: Arc::clone(&self.nw),
            db: Arc::clone(&self.db),
            config: self.config.clone(),
        }
    }
}

impl<N: Network> Dht<N> {
    /// Build a node with the protocol-default parameters and start its
    /// fibers. Fails without at least one bootstrap contact.
    pub fn new(
        me: Contact,
        bootstrap: &[Contact],
        nw: Arc<N>,
        channels: RequestChannels,
    ) -> Result<Self> {
        Self::with_config(me, bootstrap, nw, channels, DhtConfig::default())
    }

    /// Build a node with explicit parameters and start its fibers.
    pub fn with_config(
        me: Contact,
        bootstrap: &[Contact],
        nw: Arc<N>,
        channels: RequestChannels,
        config: DhtConfig,
    ) -> Result<Self> {
        let (rt, refresh_rx) = RoutingTable::new(me, bootstrap, config.t_refresh)
            .context("cannot initialize routing table")?;
        let (db, events) = Database::new(config.t_expire, config.t_replicate, config.t_republish);

        let dht = Self {
            me,
            rt,
            nw,
            db,
            config,
        };

        tokio::spawn(dht.clone().find_nodes_handler(channels.find_nodes));
        tokio::spawn(dht.clone().find_value_handler(channels.find_value));
        tokio::spawn(dht.clone().store_handler(channels.store));
        tokio::spawn(dht.clone().ping_handler(channels.ping));
        tokio::spawn(dht.clone().refresh_handler(refresh_rx));
        tokio::spawn(dht.clone().republish_handler(events.republish));
        tokio::spawn(dht.clone().replicate_handler(events.replicate));
        tokio::spawn(dht.clone().join_when_ready());

        Ok(dht)
    }

    /// This node's contact.
    pub fn me(&self) -> Contact {
        self.me
    }

    /// Number of contacts currently in the routing table.
    pub fn known_peers(&self) -> usize {
        self.rt.len()
    }

    /// Store a value in the network and return its content key.
    ///
    /// The key is always returned, even when no peer accepted the store;
    /// placement failures are logged. The value is recorded locally so it is
    /// republished for as long as it is not forgotten.
    pub async fn put(&self, value: &str) -> Result<Key> {
        let value = truncate_value(value);
        let key = self.iterative_store(value, StoreClass::Publish).await?;
        self.db.add_local_item(key, value);
        Ok(key)
    }

    /// Retrieve the value stored under `key`, together with the ID of the
    /// node that supplied it.
    pub async fn get(&self, key: Key) -> Result<(String, NodeId)> {
        // This node participates in the overlay like any other: values it
        // published or holds for the network are served directly.
        if let Some(value) = self.db.local_item(&key) {
            return Ok((value, self.me.id));
        }
        if let Ok(value) = self.db.get_item(&key) {
            return Ok((value, self.me.id));
        }

        let mut call = FindValueCall { key, found: None };
        let closest = self.walk(&mut call).await?;

        let (value, sender) = call.found.ok_or(LookupError::NotFound)?;

        // Cache promotion: place the value at the closest contact that did
        // not return it. Best effort, not retried.
        if let Some(cache_target) = closest.iter().find(|c| c.id != sender) {
            if let Err(error) = self
                .nw
                .store(key, &value, StoreClass::Publish, cache_target.addr)
                .await
            {
                debug!(peer = %cache_target.id, %error, "cache promotion failed");
            }
        }

        Ok((value, sender))
    }

    /// Challenge a contact known to the routing table and verify that the
    /// pong echoes the challenge.
    pub async fn ping(&self, target: NodeId) -> Result<Challenge> {
        let contacts = self.rt.n_closest(&target, 1).sorted_contacts();
        let contact = match contacts.first() {
            Some(contact) if contact.id == target => *contact,
            _ => bail!("ping: target node {} is not in the routing table", target),
        };

        let (result_rx, challenge) = self
            .nw
            .ping(contact.addr)
            .await
            .with_context(|| format!("cannot send ping request to {}", contact.id))?;

        let Some(pong) = result_rx.await.unwrap_or(None) else {
            bail!("ping: no response from {}", contact.id);
        };

        let dht = self.clone();
        let responder = pong.from;
        tokio::spawn(async move { dht.add_node(responder).await });

        if pong.challenge == challenge {
            Ok(challenge)
        } else {
            bail!("ping: challenge mismatch from {}", contact.id)
        }
    }

    /// Stop republishing a previously published value. Idempotent.
    pub fn forget(&self, key: &Key) {
        self.db.forget_item(key);
    }

    /// Bootstrap into the overlay: locate the neighbourhood of the local ID,
    /// then run one lookup per derived prefix ID so every bucket with
    /// reachable peers gets populated.
    pub async fn join(&self) -> Result<()> {
        let contacts = self.iterative_find_nodes(self.me.id).await?;
        info!(peers = contacts.len(), "joined the overlay");

        for target in ids_with_prefix(&self.me.id) {
            if let Err(error) = self.iterative_find_nodes(target).await {
                debug!(%error, "prefix lookup failed during join");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup internals
    // ------------------------------------------------------------------

    async fn iterative_find_nodes(&self, target: NodeId) -> Result<Vec<Contact>> {
        let mut call = FindNodesCall { target };
        self.walk(&mut call).await
    }

    /// Find the nodes closest to the value's key and place the value on up
    /// to `k` of them. The key is returned even when placement fails.
    async fn iterative_store(&self, value: &str, class: StoreClass) -> Result<Key> {
        let value = truncate_value(value);
        let key = Key::from_value(value);

        let contacts = match self.iterative_find_nodes(NodeId::from(key)).await {
            Ok(contacts) => contacts,
            Err(error) => {
                warn!(%key, %error, "store lookup failed, no peers hold the value");
                return Ok(key);
            }
        };

        let mut stored = 0usize;
        for contact in contacts.iter().take(self.config.k) {
            match self.nw.store(key, value, class, contact.addr).await {
                Ok(()) => stored += 1,
                Err(error) => {
                    warn!(peer = %contact.id, %error, "store call failed");
                }
            }
        }

        debug!(%key, stored, "value placed on peers");
        Ok(key)
    }

    /// The iterative tightening loop shared by both lookup kinds.
    async fn walk<C: Call<N>>(&self, call: &mut C) -> Result<Vec<Contact>> {
        let target = call.target();

        let mut shortlist = self.rt.n_closest(&target, self.config.alpha);
        let mut sent: HashSet<NodeId> = HashSet::new();

        // Once the closest candidate stops improving, one final round
        // queries every remaining candidate instead of only α.
        let mut rest = false;

        let mut contacts = shortlist.sorted_contacts();
        if contacts.is_empty() {
            return Err(LookupError::EmptyRoutingTable.into());
        }
        let mut closest = contacts[0];

        loop {
            let mut await_set: JoinSet<(Option<LookupResult>, Contact)> = JoinSet::new();

            for (i, contact) in contacts.iter().enumerate() {
                if i >= self.config.alpha && !rest {
                    break;
                }
                if sent.contains(&contact.id) || contact.id == self.me.id {
                    continue;
                }

                match call.dispatch(self.nw.as_ref(), contact.addr).await {
                    Ok(result_rx) => {
                        sent.insert(contact.id);
                        let callee = *contact;
                        await_set.spawn(async move { (result_rx.await.unwrap_or(None), callee) });
                    }
                    Err(error) => {
                        debug!(peer = %contact.id, %error, "dispatch failed, dropping candidate");
                        shortlist.remove(&contact.id);
                    }
                }
            }

            while let Some(joined) = await_set.join_next().await {
                let Ok((result, callee)) = joined else { continue };

                match result {
                    Some(result) => {
                        let dht = self.clone();
                        tokio::spawn(async move { dht.add_node(callee).await });

                        shortlist.add(result.closest.iter().copied());

                        if call.observe(&result, &callee) {
                            break;
                        }
                    }
                    None => {
                        debug!(peer = %callee.id, "call timed out, dropping candidate");
                        shortlist.remove(&callee.id);
                    }
                }
            }

            contacts = shortlist.sorted_contacts();
            if contacts.is_empty() {
                return Err(LookupError::NoCandidatesResponded.into());
            }

            let first = contacts[0];
            if first.id == closest.id {
                if !rest {
                    rest = true;
                    continue;
                }
                return Ok(contacts);
            }
            closest = first;
        }
    }

    /// Eviction-aware insert: when the target bucket is full, the least
    /// recently seen contact is pinged; only if it fails to answer is it
    /// replaced by the newcomer.
    async fn add_node(&self, contact: Contact) {
        loop {
            if self.rt.add(contact) {
                return;
            }

            let Some(oldest) = self.rt.head(&contact.id) else {
                // Bucket emptied in the meantime; retry the insert.
                continue;
            };

            let alive = match self.nw.ping(oldest.addr).await {
                Ok((result_rx, _challenge)) => result_rx.await.unwrap_or(None).is_some(),
                Err(error) => {
                    debug!(peer = %oldest.id, %error, "eviction ping failed");
                    false
                }
            };

            if alive {
                // The old contact answered; it keeps its place and the
                // newcomer is dropped.
                self.rt.add(oldest);
                return;
            }

            debug!(peer = %oldest.id, "evicting unresponsive contact");
            self.rt.remove(&oldest.id);
        }
    }

    // ------------------------------------------------------------------
    // Request handler fibers
    // ------------------------------------------------------------------

    async fn find_nodes_handler(self, mut requests: mpsc::Receiver<FindNodesRequest>) {
        while let Some(request) = requests.recv().await {
            debug!(from = %request.from.id, "find node request");

            let dht = self.clone();
            tokio::spawn(async move { dht.add_node(request.from).await });

            let closest = self
                .rt
                .n_closest(&request.target, self.config.k)
                .sorted_contacts();
            if let Err(error) = self
                .nw
                .send_nodes(&closest, request.session_id, request.from.addr)
                .await
            {
                warn!(%error, "cannot answer find node request");
            }
        }
    }

    async fn find_value_handler(self, mut requests: mpsc::Receiver<FindValueRequest>) {
        while let Some(request) = requests.recv().await {
            debug!(from = %request.from.id, key = %request.key, "find value request");

            let dht = self.clone();
            tokio::spawn(async move { dht.add_node(request.from).await });

            let reply = match self.db.get_item(&request.key) {
                Ok(value) => {
                    self.nw
                        .send_value(request.key, &value, &[], request.session_id, request.from.addr)
                        .await
                }
                Err(StoreError::NotFound) => {
                    let closest = self
                        .rt
                        .n_closest(&NodeId::from(request.key), self.config.k)
                        .sorted_contacts();
                    self.nw
                        .send_value(request.key, "", &closest, request.session_id, request.from.addr)
                        .await
                }
            };
            if let Err(error) = reply {
                warn!(%error, "cannot answer find value request");
            }
        }
    }

    async fn store_handler(self, mut requests: mpsc::Receiver<StoreRequest>) {
        while let Some(request) = requests.recv().await {
            debug!(from = %request.from.id, class = ?request.class, "store request");

            let dht = self.clone();
            tokio::spawn(async move { dht.add_node(request.from).await });

            // Values are content-addressed: the placement key is derived
            // from the value itself.
            let key = Key::from_value(&request.value);
            let centrality = self.rt.centrality(&NodeId::from(key));
            let touch = request.class == StoreClass::Publish;
            self.db
                .add_item(key, &request.value, centrality, self.config.k, touch);
        }
    }

    async fn ping_handler(self, mut requests: mpsc::Receiver<PingRequest>) {
        while let Some(request) = requests.recv().await {
            debug!(from = %request.from.id, "ping request");

            let dht = self.clone();
            tokio::spawn(async move { dht.add_node(request.from).await });

            if let Err(error) = self
                .nw
                .pong(request.challenge, request.session_id, request.from.addr)
                .await
            {
                warn!(%error, "cannot answer ping request");
            }
        }
    }

    async fn refresh_handler(self, mut stale: mpsc::Receiver<usize>) {
        while let Some(index) = stale.recv().await {
            let target = random_id_in_bucket(&self.me.id, index);
            debug!(bucket = index, %target, "refreshing stale bucket");

            if let Err(error) = self.iterative_find_nodes(target).await {
                debug!(bucket = index, %error, "bucket refresh lookup failed");
            }
        }
    }

    async fn republish_handler(self, mut due: mpsc::Receiver<String>) {
        while let Some(value) = due.recv().await {
            debug!("republishing local item");
            if let Err(error) = self.iterative_store(&value, StoreClass::Publish).await {
                warn!(%error, "republish failed");
            }
        }
    }

    async fn replicate_handler(self, mut due: mpsc::Receiver<String>) {
        while let Some(value) = due.recv().await {
            debug!("replicating remote item");
            if let Err(error) = self.iterative_store(&value, StoreClass::Replicate).await {
                warn!(%error, "replication failed");
            }
        }
    }

    async fn join_when_ready(self) {
        let mut ready = self.nw.ready();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                return;
            }
        }

        loop {
            match self.join().await {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, "join failed, retrying");
                    sleep(JOIN_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{random_challenge, SessionId};
    use crate::transport::{PingReceiver, PingResult};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::sync::{oneshot, watch};

    const TEST_VALUE: &str = "ABC, du är mina tankar";

    /// Scripted transport in the shape of the real one: lookup calls are
    /// answered from a fixed contact population, and the behavior knobs
    /// steer the failure paths.
    struct MockNetwork {
        others: Vec<Contact>,
        by_addr: HashMap<SocketAddr, NodeId>,
        lookup_calls: AtomicU32,
        find_value_calls: AtomicU32,
        /// Return the value on this find-value call (1-based); 0 disables.
        value_on_call: u32,
        /// When false, lookup result channels never resolve.
        respond_lookups: bool,
        /// When false, ping result channels never resolve.
        ping_alive: bool,
        /// When true, pongs carry a corrupted challenge.
        corrupt_challenge: bool,
        stores: Mutex<Vec<(Key, String, StoreClass, SocketAddr)>>,
        ready_rx: watch::Receiver<bool>,
        _ready_tx: watch::Sender<bool>,
    }

    impl MockNetwork {
        fn new(others: Vec<Contact>) -> Self {
            let by_addr = others.iter().map(|c| (c.addr, c.id)).collect();
            // Ready stays false so the bootstrap fiber never interferes.
            let (ready_tx, ready_rx) = watch::channel(false);
            Self {
                others,
                by_addr,
                lookup_calls: AtomicU32::new(0),
                find_value_calls: AtomicU32::new(0),
                value_on_call: 0,
                respond_lookups: true,
                ping_alive: true,
                corrupt_challenge: false,
                stores: Mutex::new(Vec::new()),
                ready_rx,
                _ready_tx: ready_tx,
            }
        }

        fn closest_triple(&self) -> Vec<Contact> {
            let i = self.lookup_calls.fetch_add(1, Ordering::SeqCst) as usize;
            let l = self.others.len();
            vec![
                self.others[i % l],
                self.others[(i + 1) % l],
                self.others[(i + 2) % l],
            ]
        }

        fn lookup_reply(&self, value: Option<String>) -> Result<LookupReceiver> {
            let (result_tx, result_rx) = oneshot::channel();
            if self.respond_lookups {
                let _ = result_tx.send(Some(LookupResult {
                    closest: self.closest_triple(),
                    value,
                }));
            }
            // An unresolved sender is dropped here, which the walk reads as
            // a timeout, the same as the session sweeper delivering None.
            Ok(result_rx)
        }
    }

    #[async_trait]
    impl Network for MockNetwork {
        async fn ping(&self, addr: SocketAddr) -> Result<(PingReceiver, Challenge)> {
            let challenge = random_challenge();
            let (result_tx, result_rx) = oneshot::channel();

            if self.ping_alive {
                let id = *self.by_addr.get(&addr).expect("ping to unknown test addr");
                let mut echoed = challenge;
                if self.corrupt_challenge {
                    echoed[0] ^= 0xff;
                }
                let _ = result_tx.send(Some(PingResult {
                    from: Contact::new(id, addr),
                    challenge: echoed,
                }));
            }
            Ok((result_rx, challenge))
        }

        async fn pong(&self, _: Challenge, _: SessionId, _: SocketAddr) -> Result<()> {
            Ok(())
        }

        async fn find_nodes(&self, _target: NodeId, _addr: SocketAddr) -> Result<LookupReceiver> {
            self.lookup_reply(None)
        }

        async fn find_value(&self, _key: Key, _addr: SocketAddr) -> Result<LookupReceiver> {
            let call = self.find_value_calls.fetch_add(1, Ordering::SeqCst) + 1;
            let value = if self.value_on_call != 0 && call >= self.value_on_call {
                Some(TEST_VALUE.to_string())
            } else {
                None
            };
            self.lookup_reply(value)
        }

        async fn store(
            &self,
            key: Key,
            value: &str,
            class: StoreClass,
            addr: SocketAddr,
        ) -> Result<()> {
            self.stores
                .lock()
                .unwrap()
                .push((key, value.to_string(), class, addr));
            Ok(())
        }

        async fn send_nodes(&self, _: &[Contact], _: SessionId, _: SocketAddr) -> Result<()> {
            Ok(())
        }

        async fn send_value(
            &self,
            _: Key,
            _: &str,
            _: &[Contact],
            _: SessionId,
            _: SocketAddr,
        ) -> Result<()> {
            Ok(())
        }

        fn ready(&self) -> watch::Receiver<bool> {
            self.ready_rx.clone()
        }
    }

    fn test_population(n: usize) -> Vec<Contact> {
        (0..n)
            .map(|i| {
                let addr = format!("10.10.10.{}:123", i).parse().unwrap();
                Contact::new(NodeId::random(), addr)
            })
            .collect()
    }

    fn empty_channels() -> RequestChannels {
        let (_tx1, find_nodes) = mpsc::channel(1);
        let (_tx2, find_value) = mpsc::channel(1);
        let (_tx3, store) = mpsc::channel(1);
        let (_tx4, ping) = mpsc::channel(1);
        RequestChannels {
            find_nodes,
            find_value,
            store,
            ping,
        }
    }

    fn test_dht(nw: MockNetwork, bootstrap: &[Contact]) -> Dht<MockNetwork> {
        let me = Contact::new(NodeId::random(), "10.10.10.254:123".parse().unwrap());
        Dht::new(me, bootstrap, Arc::new(nw), empty_channels()).expect("dht construction failed")
    }

    #[tokio::test]
    async fn rejects_construction_without_bootstrap() {
        let nw = MockNetwork::new(test_population(1));
        let me = Contact::new(NodeId::random(), "10.10.10.254:123".parse().unwrap());
        assert!(Dht::new(me, &[], Arc::new(nw), empty_channels()).is_err());
    }

    #[tokio::test]
    async fn join_walks_to_convergence() {
        let others = test_population(100);
        let dht = test_dht(MockNetwork::new(others.clone()), &others[..1]);

        dht.join().await.expect("join failed");
        assert!(dht.known_peers() > 1);
    }

    #[tokio::test]
    async fn put_returns_the_content_key_and_places_the_value() {
        let others = test_population(100);
        let nw = MockNetwork::new(others.clone());
        let dht = test_dht(nw, &others[..1]);

        let key = dht.put(TEST_VALUE).await.expect("put failed");
        assert_eq!(
            key.to_string(),
            "bde0e9f6e9d3fabd5bf6849e179f0aee485630f6d5c1c4398517cc1543fb9386"
        );

        let stores = dht.nw.stores.lock().unwrap();
        assert!(!stores.is_empty());
        assert!(stores.len() <= K);
        for (stored_key, value, class, _) in stores.iter() {
            assert_eq!(*stored_key, key);
            assert_eq!(value, TEST_VALUE);
            assert_eq!(*class, StoreClass::Publish);
        }
    }

    #[tokio::test]
    async fn get_returns_the_walked_value() {
        let others = test_population(100);
        let mut nw = MockNetwork::new(others.clone());
        nw.value_on_call = 4;
        let dht = test_dht(nw, &others[..1]);

        let key = Key::from_value(TEST_VALUE);
        let (value, sender) = dht.get(key).await.expect("get failed");
        assert_eq!(value, TEST_VALUE);
        assert!(others.iter().any(|c| c.id == sender));
    }

    #[tokio::test]
    async fn get_without_any_holder_is_not_found() {
        let others = test_population(20);
        let dht = test_dht(MockNetwork::new(others.clone()), &others[..1]);

        let err = dht.get(Key::from_value("missing")).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LookupError>(),
            Some(&LookupError::NotFound)
        );
    }

    #[tokio::test]
    async fn get_serves_own_published_value() {
        let others = test_population(20);
        let dht = test_dht(MockNetwork::new(others.clone()), &others[..1]);

        let key = dht.put("mine").await.unwrap();
        let (value, sender) = dht.get(key).await.unwrap();
        assert_eq!(value, "mine");
        assert_eq!(sender, dht.me().id);
    }

    #[tokio::test]
    async fn walk_fails_when_nobody_responds() {
        let others = test_population(20);
        let mut nw = MockNetwork::new(others.clone());
        nw.respond_lookups = false;
        nw.ping_alive = false;
        let dht = test_dht(nw, &others[..1]);

        let err = dht.join().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LookupError>(),
            Some(&LookupError::NoCandidatesResponded)
        );
    }

    #[tokio::test]
    async fn walk_fails_on_empty_routing_table() {
        let others = test_population(20);
        let dht = test_dht(MockNetwork::new(others.clone()), &others[..1]);
        dht.rt.remove(&others[0].id);

        let err = dht.iterative_find_nodes(NodeId::random()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<LookupError>(),
            Some(&LookupError::EmptyRoutingTable)
        );
    }

    #[tokio::test]
    async fn ping_echoes_the_challenge() {
        let others = test_population(20);
        let dht = test_dht(MockNetwork::new(others.clone()), &others[..1]);

        let target = others[0].id;
        let challenge = dht.ping(target).await.expect("ping failed");
        assert_eq!(challenge.len(), 32);
    }

    #[tokio::test]
    async fn ping_of_unknown_target_fails() {
        let others = test_population(20);
        let dht = test_dht(MockNetwork::new(others.clone()), &others[..1]);

        let err = dht.ping(NodeId::random()).await.unwrap_err();
        assert!(err.to_string().contains("not in the routing table"));
    }

    #[tokio::test]
    async fn ping_detects_challenge_mismatch() {
        let others = test_population(20);
        let mut nw = MockNetwork::new(others.clone());
        nw.corrupt_challenge = true;
        let dht = test_dht(nw, &others[..1]);

        let err = dht.ping(others[0].id).await.unwrap_err();
        assert!(err.to_string().contains("challenge mismatch"));
    }

    #[tokio::test]
    async fn ping_timeout_surfaces_as_error() {
        let others = test_population(20);
        let mut nw = MockNetwork::new(others.clone());
        nw.ping_alive = false;
        let dht = test_dht(nw, &others[..1]);

        let err = dht.ping(others[0].id).await.unwrap_err();
        assert!(err.to_string().contains("no response"));
    }

    /// Contacts that all land in the same bucket relative to `me`.
    fn same_bucket_population(me: NodeId, n: usize) -> Vec<Contact> {
        let mut out = Vec::new();
        let mut i = 0u16;
        while out.len() < n {
            let mut bytes = *me.as_bytes();
            bytes[0] ^= 0x80;
            bytes[30] = (i >> 8) as u8;
            bytes[31] = i as u8;
            i += 1;
            let id = NodeId::from_bytes(bytes);
            let addr = format!("10.10.20.{}:123", out.len()).parse().unwrap();
            out.push(Contact::new(id, addr));
        }
        out
    }

    #[tokio::test]
    async fn eviction_replaces_dead_head() {
        let me_id = NodeId::random();
        let crowd = same_bucket_population(me_id, K + 1);

        let mut nw = MockNetwork::new(crowd.clone());
        nw.ping_alive = false;
        let me = Contact::new(me_id, "10.10.10.254:123".parse().unwrap());
        let dht =
            Dht::new(me, &crowd[..1], Arc::new(nw), empty_channels()).expect("construction failed");

        for contact in &crowd[1..K] {
            assert!(dht.rt.add(*contact));
        }
        let newcomer = crowd[K];
        assert!(!dht.rt.add(newcomer), "bucket should be full");

        let oldest = dht.rt.head(&newcomer.id).unwrap();
        dht.add_node(newcomer).await;

        let remaining = dht.rt.n_closest(&newcomer.id, 500).sorted_contacts();
        assert!(remaining.iter().any(|c| c.id == newcomer.id));
        assert!(remaining.iter().all(|c| c.id != oldest.id));
    }

    #[tokio::test]
    async fn eviction_keeps_live_head() {
        let me_id = NodeId::random();
        let crowd = same_bucket_population(me_id, K + 1);

        let nw = MockNetwork::new(crowd.clone());
        let me = Contact::new(me_id, "10.10.10.254:123".parse().unwrap());
        let dht =
            Dht::new(me, &crowd[..1], Arc::new(nw), empty_channels()).expect("construction failed");

        for contact in &crowd[1..K] {
            assert!(dht.rt.add(*contact));
        }
        let newcomer = crowd[K];
        let oldest = dht.rt.head(&newcomer.id).unwrap();

        dht.add_node(newcomer).await;

        let remaining = dht.rt.n_closest(&newcomer.id, 500).sorted_contacts();
        assert!(remaining.iter().all(|c| c.id != newcomer.id));
        assert!(remaining.iter().any(|c| c.id == oldest.id));
    }
}
