//! # Wire Protocol
//!
//! Every UDP datagram carries one [`Packet`]: a session identifier for
//! request/response correlation, the sender's node ID, and a payload that is
//! a tagged union over the six message kinds:
//!
//! | Kind | Role |
//! |------|------|
//! | `Ping` / `Pong` | liveness challenge and its echo |
//! | `FindNode` / `NodeList` | node lookup request and response |
//! | `FindValue` / `Value` | value lookup request and response |
//! | `Store` | value placement, no response |
//!
//! Packets are encoded with bincode using fixed-width big-endian integers
//! and a deserialization size bound, so a hostile datagram can neither
//! allocate unbounded memory nor smuggle trailing data.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use bincode::Options;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::id::{Key, NodeId};

/// Maximum datagram size; also the receive buffer size.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Width of session identifiers and ping challenges.
pub const SESSION_ID_BYTES: usize = 32;

/// A random token correlating a request with its response.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; SESSION_ID_BYTES]);

impl SessionId {
    /// Generate a fresh random session identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; SESSION_ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_ID_BYTES] {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

/// A 32-byte random ping challenge, echoed verbatim by the pong.
pub type Challenge = [u8; SESSION_ID_BYTES];

/// Generate a fresh random ping challenge.
pub fn random_challenge() -> Challenge {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Classification of an outbound store.
///
/// `Publish` is a fresh placement: the receiver (re)computes the item's
/// expiration. `Replicate` is a refresh of an item the network already
/// holds: the receiver leaves an existing entry untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreClass {
    Publish,
    Replicate,
}

/// Wire form of a contact.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub ip: Vec<u8>,
    pub port: u32,
}

impl NodeInfo {
    pub fn from_contact(contact: &Contact) -> Self {
        let ip = match contact.addr.ip() {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        Self {
            id: contact.id,
            ip,
            port: contact.addr.port() as u32,
        }
    }

    /// Convert back to a contact; `None` when the address bytes or port are
    /// not a valid endpoint.
    pub fn to_contact(&self) -> Option<Contact> {
        let ip: IpAddr = match self.ip.len() {
            4 => {
                let octets: [u8; 4] = self.ip.as_slice().try_into().ok()?;
                IpAddr::from(octets)
            }
            16 => {
                let octets: [u8; 16] = self.ip.as_slice().try_into().ok()?;
                IpAddr::from(octets)
            }
            _ => return None,
        };
        let port = u16::try_from(self.port).ok()?;
        Some(Contact::new(self.id, SocketAddr::new(ip, port)))
    }
}

/// Convert a contact list to its wire form.
pub fn node_infos(contacts: &[Contact]) -> Vec<NodeInfo> {
    contacts.iter().map(NodeInfo::from_contact).collect()
}

/// Convert a wire node list back to contacts, dropping invalid entries.
pub fn contacts_from(nodes: &[NodeInfo]) -> Vec<Contact> {
    nodes.iter().filter_map(NodeInfo::to_contact).collect()
}

/// The tagged union of message kinds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    Ping { challenge: Challenge },
    Pong { challenge: Challenge },
    FindNode { target: NodeId },
    NodeList { nodes: Vec<NodeInfo> },
    FindValue { key: Key },
    Value { key: Key, value: String, nodes: Vec<NodeInfo> },
    Store { key: Key, value: String, class: StoreClass },
}

/// One UDP datagram.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Packet {
    pub session_id: SessionId,
    pub sender_id: NodeId,
    pub payload: Payload,
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE as u64)
        .with_fixint_encoding()
        .with_big_endian()
}

pub fn encode(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(packet)
}

pub fn decode(bytes: &[u8]) -> Result<Packet, bincode::Error> {
    bincode_options().deserialize(bytes)
}
