//! # Routing Table
//!
//! Kademlia routing table with XOR-based distance metric.
//!
//! ## Bucket Organization
//!
//! The table holds 256 buckets indexed by [`crate::id::Distance::bucket_index`]:
//!
//! - Bucket 0: contacts whose distance has its top bit set (furthest half of
//!   the keyspace)
//! - Bucket 1: next quarter of the keyspace
//! - ...
//! - Bucket 255: the self bucket (zero distance); never populated, since the
//!   local node is kept out of the table
//!
//! Each bucket is a bounded most-recently-seen-first list of up to `k`
//! contacts. A full bucket rejects new contacts; the caller then runs the
//! eviction protocol (ping the oldest, replace it only if it fails to answer).
//!
//! ## Concurrency
//!
//! Every bucket sits behind its own readers/writer lock. Single-bucket
//! operations take one lock; [`RoutingTable::n_closest`] takes a short read
//! lock per bucket it visits. Mutations update the bucket's `last_access`.
//!
//! ## Refresh
//!
//! A maintenance fiber scans all buckets once per second and emits the index
//! of any non-empty bucket that has seen no access for the refresh interval.
//! Emission counts as an access, so a stale bucket is reported once per
//! refresh interval, not once per tick.

use std::sync::{Arc, RwLock};

use anyhow::{bail, Result};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant};
use tracing::debug;

use crate::contact::{Contact, Shortlist};
use crate::id::{NodeId, ID_BITS};

/// Bucket capacity and replication fan-out.
pub const K: usize = 20;

/// How often the maintenance fiber scans for stale buckets.
const REFRESH_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the refresh index channel.
const REFRESH_CHANNEL_SIZE: usize = 16;

struct Bucket {
    /// Most recently seen contact first.
    contacts: Vec<Contact>,
    last_access: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_access: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Insert or refresh a contact. Returns false when the bucket is full
    /// and the contact is not already present.
    fn add(&mut self, contact: Contact, k: usize) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            self.contacts.insert(0, contact);
            self.touch();
            return true;
        }

        if self.contacts.len() < k {
            self.contacts.insert(0, contact);
            self.touch();
            return true;
        }

        false
    }

    fn remove(&mut self, id: &NodeId) {
        if let Some(pos) = self.contacts.iter().position(|c| &c.id == id) {
            self.contacts.remove(pos);
            self.touch();
        }
    }

    /// Least recently seen contact, if any.
    fn head(&self) -> Option<Contact> {
        self.contacts.last().copied()
    }
}

/// Bounded, distance-stratified view of the overlay.
pub struct RoutingTable {
    me: Contact,
    k: usize,
    refresh_interval: Duration,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    /// Create a table seeded with the bootstrap contacts and start its
    /// maintenance fiber. Returns the table together with the stream of
    /// stale bucket indices.
    pub fn new(
        me: Contact,
        bootstrap: &[Contact],
        refresh_interval: Duration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<usize>)> {
        if bootstrap.is_empty() {
            bail!("at least one bootstrap contact must be provided");
        }

        let mut buckets = Vec::with_capacity(ID_BITS);
        for _ in 0..ID_BITS {
            buckets.push(RwLock::new(Bucket::new()));
        }

        let table = Arc::new(Self {
            me,
            k: K,
            refresh_interval,
            buckets,
        });

        for contact in bootstrap {
            table.add(*contact);
        }

        let (refresh_tx, refresh_rx) = mpsc::channel(REFRESH_CHANNEL_SIZE);
        tokio::spawn(Arc::clone(&table).scan_stale_buckets(refresh_tx));

        Ok((table, refresh_rx))
    }

    /// The local node's contact.
    pub fn me(&self) -> Contact {
        self.me
    }

    fn bucket_of(&self, id: &NodeId) -> usize {
        self.me.id.distance(id).bucket_index()
    }

    /// Insert or refresh a contact.
    ///
    /// Adding the local node is a no-op reported as success. Returns false
    /// when the target bucket is full; the caller must then run the eviction
    /// protocol against [`RoutingTable::head`].
    pub fn add(&self, contact: Contact) -> bool {
        if contact.id == self.me.id {
            return true;
        }
        let index = self.bucket_of(&contact.id);
        self.buckets[index].write().unwrap().add(contact, self.k)
    }

    /// Least recently seen contact in the bucket that `id` maps to.
    pub fn head(&self, id: &NodeId) -> Option<Contact> {
        let index = self.bucket_of(id);
        self.buckets[index].read().unwrap().head()
    }

    /// Remove the contact with `id` if present. Idempotent.
    pub fn remove(&self, id: &NodeId) {
        let index = self.bucket_of(id);
        self.buckets[index].write().unwrap().remove(id);
    }

    /// Up to `n` contacts closest to `target` in XOR distance, as a shortlist.
    ///
    /// Visits buckets outward from the target bucket, taking a short read
    /// lock on each, then truncates the distance-sorted view to `n`.
    pub fn n_closest(&self, target: &NodeId, n: usize) -> Shortlist {
        let index = self.bucket_of(target);
        let mut candidates: Vec<Contact> = Vec::new();

        let mut visit = |i: usize| {
            let bucket = self.buckets[i].read().unwrap();
            candidates.extend(bucket.contacts.iter().copied());
        };

        visit(index);
        for offset in 1..ID_BITS {
            if index >= offset {
                visit(index - offset);
            }
            if index + offset < ID_BITS {
                visit(index + offset);
            }
        }

        candidates.sort_by_key(|c| c.id.distance(target));
        candidates.truncate(n);

        Shortlist::new(*target, candidates)
    }

    /// Number of contacts in buckets `0..=bucket_index(target)`: how much of
    /// the table sits at the target's distance band or further out. Drives
    /// the expiration weighting of remote items.
    pub fn centrality(&self, target: &NodeId) -> usize {
        let index = self.bucket_of(target);
        self.buckets[..=index]
            .iter()
            .map(|b| b.read().unwrap().contacts.len())
            .sum()
    }

    /// Total number of contacts in the table.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.read().unwrap().contacts.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn scan_stale_buckets(self: Arc<Self>, refresh_tx: mpsc::Sender<usize>) {
        let mut ticker = interval(REFRESH_SCAN_INTERVAL);
        loop {
            ticker.tick().await;

            let now = Instant::now();
            let mut stale = Vec::new();
            for (index, bucket) in self.buckets.iter().enumerate() {
                let mut bucket = bucket.write().unwrap();
                if !bucket.contacts.is_empty()
                    && now.duration_since(bucket.last_access) > self.refresh_interval
                {
                    bucket.last_access = now;
                    stale.push(index);
                }
            }

            for index in stale {
                debug!(bucket = index, "bucket is stale, requesting refresh");
                if refresh_tx.send(index).await.is_err() {
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn bucket_ids(&self, index: usize) -> Vec<NodeId> {
        self.buckets[index]
            .read()
            .unwrap()
            .contacts
            .iter()
            .map(|c| c.id)
            .collect()
    }
}

/// Verify the bucket-placement invariant over the whole table; test support.
#[cfg(test)]
pub(crate) fn assert_invariants(table: &RoutingTable) {
    let mut seen = std::collections::HashSet::new();
    for (index, bucket) in table.buckets.iter().enumerate() {
        let bucket = bucket.read().unwrap();
        assert!(bucket.contacts.len() <= table.k);
        for contact in &bucket.contacts {
            assert_ne!(contact.id, table.me.id, "table contains the local node");
            assert_eq!(
                table.me.id.distance(&contact.id).bucket_index(),
                index,
                "contact stored in the wrong bucket"
            );
            assert!(seen.insert(contact.id), "duplicate contact in table");
        }
    }
}
