//! Peer contacts and the lookup shortlist.
//!
//! A [`Contact`] pairs a node identifier with its UDP endpoint. The
//! [`Shortlist`] is the working set of a lookup: a set of contacts keyed by
//! node ID, built around a fixed target, able to produce views sorted by XOR
//! distance to that target.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crate::id::NodeId;

/// A peer known to this node: its identifier and UDP endpoint.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({} @ {})", self.id, self.addr)
    }
}

/// The candidate set of a lookup, keyed by node ID.
///
/// Membership is by identifier: adding a contact twice keeps a single entry,
/// and removal is idempotent. [`Shortlist::sorted_contacts`] recomputes the
/// distance-sorted view on demand; callers must tolerate reordering after
/// mutation.
pub struct Shortlist {
    target: NodeId,
    contacts: HashMap<NodeId, Contact>,
}

impl Shortlist {
    /// Create a shortlist around `target`, seeded with `contacts`.
    pub fn new(target: NodeId, contacts: impl IntoIterator<Item = Contact>) -> Self {
        let mut sl = Self {
            target,
            contacts: HashMap::new(),
        };
        sl.add(contacts);
        sl
    }

    /// Insert contacts, deduplicating by node ID.
    pub fn add(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            self.contacts.insert(contact.id, contact);
        }
    }

    /// Remove the contact with `id` if present.
    pub fn remove(&mut self, id: &NodeId) {
        self.contacts.remove(id);
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// All contacts, ascending by XOR distance to the shortlist target.
    ///
    /// Equidistant contacts keep the byte-lexicographic order of their
    /// distances, which for XOR means identical IDs only.
    pub fn sorted_contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts.values().copied().collect();
        contacts.sort_by_key(|c| c.id.distance(&self.target));
        contacts
    }
}
