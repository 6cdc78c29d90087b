//! # Content Store
//!
//! Two key-value tables under independent readers/writer locks:
//!
//! - **Remote items**: values stored on behalf of the network. Each carries
//!   an expiration instant; expiration is longer the fewer replicas exist
//!   near the key (centrality weighting), and every read or fresh store
//!   pushes it forward.
//! - **Local items**: values this node has published. Each carries a
//!   republish instant. Only local items produce republish events; only
//!   remote items produce replication events.
//!
//! ## Maintenance
//!
//! Two fibers run on clock ticks:
//!
//! - the *expirer* deletes remote items whose expiration has passed
//! - the *republisher* emits due local items on the republish channel and,
//!   once per replication interval, every remote item on the replicate
//!   channel
//!
//! The DHT layer turns republish events into `Publish`-class iterative
//! stores and replicate events into `Replicate`-class ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use tracing::debug;

use crate::id::{truncate_value, Key};

/// How often the maintenance fibers wake up.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Capacity of the republish and replicate event channels.
const EVENT_CHANNEL_SIZE: usize = 16;

/// Store lookup failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No item under the requested key.
    NotFound,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => f.write_str("value not found"),
        }
    }
}

impl std::error::Error for StoreError {}

struct RemoteItem {
    value: String,
    expire: Instant,
}

struct LocalItem {
    value: String,
    republish: Instant,
}

/// Maintenance event streams handed to the DHT layer.
pub struct DatabaseEvents {
    /// Values of local items that are due for republishing.
    pub republish: mpsc::Receiver<String>,
    /// Values of remote items due for replication.
    pub replicate: mpsc::Receiver<String>,
}

/// The node's content store.
pub struct Database {
    remote: RwLock<HashMap<Key, RemoteItem>>,
    local: RwLock<HashMap<Key, LocalItem>>,
    next_replicate: Mutex<Instant>,
    t_expire: Duration,
    t_replicate: Duration,
    t_republish: Duration,
    republish_tx: mpsc::Sender<String>,
    replicate_tx: mpsc::Sender<String>,
}

impl Database {
    /// Create the store and start its maintenance fibers.
    pub fn new(
        t_expire: Duration,
        t_replicate: Duration,
        t_republish: Duration,
    ) -> (Arc<Self>, DatabaseEvents) {
        let (republish_tx, republish_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (replicate_tx, replicate_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let db = Arc::new(Self {
            remote: RwLock::new(HashMap::new()),
            local: RwLock::new(HashMap::new()),
            next_replicate: Mutex::new(Instant::now() + t_replicate),
            t_expire,
            t_replicate,
            t_republish,
            republish_tx,
            replicate_tx,
        });

        tokio::spawn(Arc::clone(&db).expire_items());
        tokio::spawn(Arc::clone(&db).republish_items());

        (
            db,
            DatabaseEvents {
                republish: republish_rx,
                replicate: replicate_rx,
            },
        )
    }

    /// Store or refresh a remote item.
    ///
    /// An existing key with `touch == false` (a replication refresh) is left
    /// untouched. Otherwise the expiration is recomputed from the caller's
    /// centrality: few known contacts near the key mean few replicas, so the
    /// item is kept longer.
    pub fn add_item(&self, key: Key, value: &str, centrality: usize, k: usize, touch: bool) {
        let mut remote = self.remote.write().unwrap();

        if !touch && remote.contains_key(&key) {
            return;
        }

        let expire = if centrality > k {
            Instant::now() + self.t_expire
        } else {
            let exponent = k as f64 / centrality.max(1) as f64;
            Instant::now() + Duration::from_secs_f64(self.t_expire.as_secs_f64() * exponent.exp())
        };

        remote.insert(
            key,
            RemoteItem {
                value: truncate_value(value).to_owned(),
                expire,
            },
        );
    }

    /// Fetch a remote item, extending its life on access.
    pub fn get_item(&self, key: &Key) -> Result<String, StoreError> {
        let mut remote = self.remote.write().unwrap();
        let item = remote.get_mut(key).ok_or(StoreError::NotFound)?;
        item.expire = Instant::now() + self.t_expire;
        Ok(item.value.clone())
    }

    /// Record a value published by this node, scheduling its republication.
    pub fn add_local_item(&self, key: Key, value: &str) {
        let mut local = self.local.write().unwrap();
        local.insert(
            key,
            LocalItem {
                value: truncate_value(value).to_owned(),
                republish: Instant::now() + self.t_republish,
            },
        );
    }

    /// The value of a local item, if this node published one under `key`.
    pub fn local_item(&self, key: &Key) -> Option<String> {
        self.local.read().unwrap().get(key).map(|item| item.value.clone())
    }

    /// Forget a published value, halting its republication. Idempotent.
    pub fn forget_item(&self, key: &Key) {
        self.local.write().unwrap().remove(key);
    }

    async fn expire_items(self: Arc<Self>) {
        let mut ticker = interval(MAINTENANCE_TICK);
        loop {
            ticker.tick().await;

            let now = Instant::now();
            let mut remote = self.remote.write().unwrap();
            let before = remote.len();
            remote.retain(|_, item| item.expire > now);
            let evicted = before - remote.len();
            drop(remote);

            if evicted > 0 {
                debug!(evicted, "expired remote items");
            }
        }
    }

    async fn republish_items(self: Arc<Self>) {
        let mut ticker = interval(MAINTENANCE_TICK);
        loop {
            ticker.tick().await;
            let now = Instant::now();

            let due: Vec<String> = {
                let mut local = self.local.write().unwrap();
                local
                    .values_mut()
                    .filter(|item| item.republish <= now)
                    .map(|item| {
                        item.republish = now + self.t_republish;
                        item.value.clone()
                    })
                    .collect()
            };
            for value in due {
                if self.republish_tx.send(value).await.is_err() {
                    return;
                }
            }

            let replicate_due = {
                let mut next = self.next_replicate.lock().unwrap();
                if now >= *next {
                    *next = now + self.t_replicate;
                    true
                } else {
                    false
                }
            };
            if replicate_due {
                let values: Vec<String> = {
                    let remote = self.remote.read().unwrap();
                    remote.values().map(|item| item.value.clone()).collect()
                };
                for value in values {
                    if self.replicate_tx.send(value).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MAX_VALUE_BYTES;
    use tokio::time::advance;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86400);

    fn database() -> (Arc<Database>, DatabaseEvents) {
        Database::new(DAY, HOUR, DAY)
    }

    #[tokio::test]
    async fn get_returns_stored_value_and_extends_expiry() {
        let (db, _events) = database();
        let key = Key::from_value("v");

        db.add_item(key, "v", 100, 20, true);
        let first_expire = db.remote.read().unwrap().get(&key).unwrap().expire;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(db.get_item(&key).unwrap(), "v");

        let extended = db.remote.read().unwrap().get(&key).unwrap().expire;
        assert!(extended > first_expire);
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let (db, _events) = database();
        assert_eq!(db.get_item(&Key::from_value("nope")), Err(StoreError::NotFound));
    }

    #[tokio::test]
    async fn replicate_class_store_leaves_existing_item_alone() {
        let (db, _events) = database();
        let key = Key::from_value("original");

        db.add_item(key, "original", 100, 20, true);
        db.add_item(key, "impostor", 100, 20, false);

        assert_eq!(db.get_item(&key).unwrap(), "original");
    }

    #[tokio::test]
    async fn low_centrality_extends_expiration() {
        let (db, _events) = database();
        let near = Key::from_value("near");
        let far = Key::from_value("far");

        db.add_item(near, "near", 1, 20, true);
        db.add_item(far, "far", 100, 20, true);

        let remote = db.remote.read().unwrap();
        assert!(remote.get(&near).unwrap().expire > remote.get(&far).unwrap().expire);
    }

    #[tokio::test]
    async fn zero_centrality_does_not_panic() {
        let (db, _events) = database();
        let key = Key::from_value("lonely");
        db.add_item(key, "lonely", 0, 20, true);
        assert_eq!(db.get_item(&key).unwrap(), "lonely");
    }

    #[tokio::test]
    async fn values_are_truncated() {
        let (db, _events) = database();
        let long = "x".repeat(MAX_VALUE_BYTES + 500);
        let key = Key::from_value(&long);

        db.add_item(key, &long, 100, 20, true);
        assert_eq!(db.get_item(&key).unwrap().len(), MAX_VALUE_BYTES);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_items_are_evicted_by_next_tick() {
        let (db, _events) = Database::new(Duration::ZERO, HOUR, DAY);
        let key = Key::from_value("ephemeral");

        db.add_item(key, "ephemeral", 100, 20, true);
        advance(MAINTENANCE_TICK + Duration::from_millis(100)).await;

        assert_eq!(db.get_item(&key), Err(StoreError::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn local_item_republishes_after_interval() {
        let t_republish = Duration::from_secs(5);
        let (db, mut events) = Database::new(DAY, HOUR, t_republish);

        db.add_local_item(Key::from_value("mine"), "mine");
        advance(t_republish + MAINTENANCE_TICK).await;

        let value = events.republish.recv().await.expect("expected republish event");
        assert_eq!(value, "mine");

        // The schedule resets; nothing more until another interval passes.
        assert!(events.republish.try_recv().is_err());
        advance(t_republish + MAINTENANCE_TICK).await;
        assert_eq!(events.republish.recv().await.as_deref(), Some("mine"));
    }

    #[tokio::test(start_paused = true)]
    async fn forgotten_item_stops_republishing() {
        let t_republish = Duration::from_secs(5);
        let (db, mut events) = Database::new(DAY, HOUR, t_republish);

        let key = Key::from_value("mine");
        db.add_local_item(key, "mine");
        db.forget_item(&key);
        db.forget_item(&key);

        advance(t_republish * 3).await;
        assert!(events.republish.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_items_replicate_each_interval() {
        let t_replicate = Duration::from_secs(10);
        let (db, mut events) = Database::new(DAY, t_replicate, DAY);

        db.add_item(Key::from_value("a"), "a", 100, 20, true);
        db.add_item(Key::from_value("b"), "b", 100, 20, true);

        advance(t_replicate + MAINTENANCE_TICK).await;

        let mut values = vec![
            events.replicate.recv().await.unwrap(),
            events.replicate.recv().await.unwrap(),
        ];
        values.sort();
        assert_eq!(values, vec!["a", "b"]);
        assert!(events.replicate.try_recv().is_err());
    }
}
