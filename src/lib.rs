//! # Kelda - Kademlia-style Distributed Hash Table Node
//!
//! Kelda is a peer in a structured overlay that collectively stores short
//! values addressed by the BLAKE2b-256 hash of their content. Each node
//! participates in routing, storage and lookup over a single UDP socket;
//! clients talk to any node to publish a value (receiving its content hash)
//! or to retrieve a value by hash.
//!
//! ## Architecture
//!
//! Every long-running subsystem is its own tokio fiber, coordinated through
//! channels: the transport listen loop, the session table sweepers, the
//! content store's expirer and republisher, and one handler fiber per
//! inbound request kind. Shared state (routing buckets, item maps, session
//! tables) sits behind short-held locks.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | 256-bit identifiers, XOR metric, content keys |
//! | `contact` | Peer contacts and the lookup shortlist |
//! | `routing` | 256-bucket routing table with refresh scheduling |
//! | `store` | Remote/local item maps with clock-driven maintenance |
//! | `packet` | Wire packet schema and bounded bincode codec |
//! | `transport` | UDP socket, session tables, request channels |
//! | `dht` | The node façade: walks, handlers, `put`/`get`/`ping` |
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kelda::{Contact, Dht, NodeId, UdpNetwork};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let (network, channels) =
//!     UdpNetwork::bind(NodeId::random(), "0.0.0.0:4000".parse()?).await?;
//! tokio::spawn(Arc::clone(&network).listen());
//!
//! let bootstrap = Contact::new(
//!     "bde0e9f6e9d3fabd5bf6849e179f0aee485630f6d5c1c4398517cc1543fb9386".parse()?,
//!     "203.0.113.7:4000".parse()?,
//! );
//! let dht = Dht::new(network.me(), &[bootstrap], network.clone(), channels)?;
//!
//! let key = dht.put("hello overlay").await?;
//! let (value, sender) = dht.get(key).await?;
//! # let _ = (value, sender);
//! # Ok(())
//! # }
//! ```

pub mod contact;
pub mod dht;
pub mod id;
pub mod packet;
pub mod routing;
pub mod store;
pub mod transport;

pub use contact::Contact;
pub use dht::{Dht, DhtConfig, LookupError, ALPHA};
pub use id::{Key, NodeId, MAX_VALUE_BYTES};
pub use packet::StoreClass;
pub use routing::K;
pub use store::{Database, StoreError};
pub use transport::{Network, RequestChannels, UdpNetwork, NETWORK_TIMEOUT};
