//! Kademlia-style DHT: 160-bit identifier space, a bucketed routing table,
//! bencoded KRPC transport, token-gated `announce_peer`, and iterative
//! `find_node`/`get_peers` lookups.
use thiserror::Error;

pub mod krpc;
pub mod lookup;
pub mod node;
pub mod routing_table;
pub mod server;
pub mod token;

pub use lookup::LookupResult;
pub use node::{Node, NodeId};
pub use routing_table::{NodeHealth, RoutingTable};
pub use server::{DhtServer, GetPeersResult};
pub use token::TokenManager;

/// Bits in the identifier space; also the number of k-buckets.
pub const ID_BITS: usize = 160;

/// Maximum entries per k-bucket.
pub const BUCKET_SIZE: usize = 8;

/// Lookup fan-out: number of not-yet-queried nodes queried per round.
pub const ALPHA: usize = 3;

/// A bucket untouched for this long must be refreshed.
pub const BUCKET_REFRESH_INTERVAL_SECS: u64 = 15 * 60;

/// Token secrets rotate on this cadence; both the current and previous
/// secret remain valid for `announce_peer`.
pub const TOKEN_ROTATION_INTERVAL_SECS: u64 = 60 * 60;

/// Wall-clock budget for one iterative lookup.
pub const LOOKUP_BUDGET_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("malformed KRPC message: {0}")]
    MalformedMessage(String),

    #[error("KRPC error response: [{code}] {message}")]
    RemoteError { code: i64, message: String },

    #[error("KRPC transaction timed out")]
    TransactionTimedOut,

    #[error("invalid announce_peer token")]
    InvalidToken,
}

pub type DhtResult<T> = std::result::Result<T, DhtError>;

/// Seeds the routing table by sending `find_node(our_id)` to each bootstrap
/// endpoint. A responding endpoint's real node id is learned from the
/// response itself; endpoints that never respond are never added, so no
/// placeholder id ever lands in a bucket.
#[tracing::instrument(skip(server, endpoints))]
pub async fn bootstrap(server: &std::sync::Arc<server::DhtServer>, endpoints: &[std::net::SocketAddr]) -> usize {
    let our_id = server.our_id();
    let mut responded = 0;
    for &addr in endpoints {
        match server.find_node(addr, our_id).await {
            Ok(_) => responded += 1,
            Err(e) => tracing::debug!(%addr, error = %e, "bootstrap node did not respond"),
        }
    }
    responded
}
