//! Mainline DHT routing table with BEP33 swarm-health lookups.
//!
//! A single event loop owns the UDP socket, the Kademlia-style routing table and every lookup in
//! flight. [`SwarmDht`] is the handle used to talk to it:
//!
//! - `bootstrap` fills the routing table from seed addresses,
//! - `check_health` estimates the seeders and leechers of a torrent from the `BFsd`/`BFpe`
//!   Bloom filters returned by scrape `get_peers` requests,
//! - `closest_nodes` and `stats` inspect the routing table.
//!
//! Every outgoing message carries a `v` key. Peers whose version starts with `NS` are trusted more
//! when refreshing the table.

pub mod router;
pub mod routing;
pub mod time;

mod bloom;
mod builder;
mod compact;
mod config;
mod id;
mod message;
mod transaction;
mod worker;

pub use crate::bloom::{BloomFilter, BLOOM_FILTER_LEN};
pub use crate::builder::{DhtBuilder, SwarmDht};
pub use crate::config::{Config, NS_VERSION_PREFIX};
pub use crate::id::{InfoHash, LengthError, NodeId, ShaHash, INFO_HASH_LEN, NODE_ID_LEN};
pub use crate::routing::{
    manager::Mode,
    node::{NodeHandle, RoutingNode},
};
pub use crate::time::{Clock, TokioClock};
pub use crate::worker::{HealthError, HealthResult, SocketTransport, Stats};
