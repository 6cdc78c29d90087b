//! # Node Identifiers and the XOR Metric
//!
//! This module defines the core identifier types used throughout Kelda:
//!
//! - [`NodeId`]: 256-bit node identifier, fixed for the lifetime of a node
//! - [`Key`]: 256-bit content key, the BLAKE2b-256 digest of a stored value
//! - [`Distance`]: bytewise XOR of two identifiers, ordered lexicographically
//!
//! ## XOR Metric
//!
//! Kademlia routing interprets `a ^ b` as an unsigned big-endian integer.
//! [`Distance::bucket_index`] maps a distance to the routing table bucket
//! holding contacts at that distance: the position of the most significant
//! set bit counted from the top, with the all-zero distance mapping to the
//! self bucket (index 255).
//!
//! ## Derived Identifiers
//!
//! Two generators produce identifiers at controlled distances from a base:
//!
//! - [`ids_with_prefix`] yields one identifier per prefix length, used by
//!   `join` to populate every bucket that has reachable peers
//! - [`random_id_in_bucket`] yields a random identifier falling into a
//!   specific bucket, used when refreshing a stale bucket

use std::fmt;
use std::str::FromStr;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifier width in bits.
pub const ID_BITS: usize = 256;

/// Identifier width in bytes.
pub const ID_BYTES: usize = ID_BITS / 8;

/// Values are truncated to this many bytes before hashing and storage.
pub const MAX_VALUE_BYTES: usize = 1000;

type Blake2b256 = Blake2b<U32>;

/// A 256-bit node identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    /// Generate a new identifier from OS entropy.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR metric distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut d = [0u8; ID_BYTES];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(d)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = parse_hex_id(s)?;
        Ok(Self(bytes))
    }
}

impl From<Key> for NodeId {
    fn from(key: Key) -> Self {
        Self(key.0)
    }
}

/// A 256-bit content key: the BLAKE2b-256 digest of the stored value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key([u8; ID_BYTES]);

impl Key {
    /// Hash a value into its content key.
    ///
    /// The value is truncated to [`MAX_VALUE_BYTES`] before hashing, so the
    /// key always matches what the store actually keeps.
    pub fn from_value(value: &str) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(truncate_value(value).as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(self.0))
    }
}

impl FromStr for Key {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = parse_hex_id(s)?;
        Ok(Self(bytes))
    }
}

impl From<NodeId> for Key {
    fn from(id: NodeId) -> Self {
        Self(id.0)
    }
}

fn parse_hex_id(s: &str) -> anyhow::Result<[u8; ID_BYTES]> {
    use anyhow::Context;

    let decoded = hex::decode(s).context("cannot decode hex string as identifier")?;
    let bytes: [u8; ID_BYTES] = decoded
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("identifier must be {} bytes, got {}", ID_BYTES, v.len()))?;
    Ok(bytes)
}

/// Truncate a value to at most [`MAX_VALUE_BYTES`] bytes.
///
/// Backs off to the nearest character boundary at or below the limit so the
/// result is always valid UTF-8.
pub fn truncate_value(value: &str) -> &str {
    if value.len() <= MAX_VALUE_BYTES {
        return value;
    }
    let mut end = MAX_VALUE_BYTES;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// XOR metric distance between two 256-bit identifiers.
///
/// Ordering is lexicographic on the bytes, equivalent to comparing the
/// distances as unsigned big-endian integers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    /// Index of the routing table bucket for this distance.
    ///
    /// Counts the position of the most significant set bit from the top.
    /// The all-zero distance maps to the self bucket, index 255. The result
    /// always lies in `[0, 255]`.
    pub fn bucket_index(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS - 1
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// Generate one random identifier per prefix length of `id`.
///
/// The `i`th identifier (starting at prefix length 255) keeps the first
/// `255 - i` bits of `id`, flips the bit just after the kept prefix, and
/// randomises the rest. Each result therefore lands in a distinct routing
/// table bucket relative to `id`, which is what `join` relies on to touch
/// every bucket that has reachable peers.
pub fn ids_with_prefix(id: &NodeId) -> Vec<NodeId> {
    let mut out = Vec::with_capacity(ID_BITS - 1);

    for i in 1..ID_BITS {
        let byte_idx = (i - 1) / 8;

        let mut next = NodeId::random().0;
        next[..byte_idx].copy_from_slice(&id.0[..byte_idx]);

        // Bit position of the flipped bit inside the partially kept byte.
        let last_bit = (i - byte_idx * 8) as u32;
        let prefix_mask: u8 = 0xffu8 << (8 - last_bit);
        let suffix_mask = !prefix_mask;

        let mut n = id.0[byte_idx] & prefix_mask;
        n ^= 1 << (8 - last_bit);
        n |= next[byte_idx] & suffix_mask;
        next[byte_idx] = n;

        out.push(NodeId(next));
    }

    out
}

/// Generate a random identifier whose distance to `self_id` falls into the
/// bucket at `index`. Used to pick lookup targets when refreshing a bucket.
pub fn random_id_in_bucket(self_id: &NodeId, index: usize) -> NodeId {
    let mut distance = [0u8; ID_BYTES];
    OsRng.fill_bytes(&mut distance);

    let byte_idx = index / 8;
    let bit_pos = index % 8;

    for byte in distance.iter_mut().take(byte_idx) {
        *byte = 0;
    }

    let target_bit = 0x80u8 >> bit_pos;
    let random_mask = target_bit.wrapping_sub(1);
    distance[byte_idx] = target_bit | (distance[byte_idx] & random_mask);

    let mut target = [0u8; ID_BYTES];
    for (i, byte) in target.iter_mut().enumerate() {
        *byte = self_id.0[i] ^ distance[i];
    }
    NodeId(target)
}
