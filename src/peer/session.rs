//! Per-peer session state: the four-flag choke/interest state machine,
//! the piece-have vector, and pending request bookkeeping.
use super::bitfield::Bitfield;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Deadline after which a pending outbound REQUEST is considered lost and
/// eligible for reassignment.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on simultaneously in-flight outbound REQUESTs per peer.
pub const MAX_PIPELINE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl PeerFlags {
    /// `!peer_choking && am_interested`: we may send REQUESTs.
    pub fn can_download(&self) -> bool {
        !self.peer_choking && self.am_interested
    }

    /// `!am_choking && peer_interested`: we may serve the peer's REQUESTs.
    pub fn may_upload(&self) -> bool {
        !self.am_choking && self.peer_interested
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub piece_index: u32,
    pub offset: u32,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub length: u32,
    pub requested_at: Instant,
}

impl PendingRequest {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.requested_at) >= REQUEST_TIMEOUT
    }
}

/// Tracks one peer connection's protocol state between handshake and
/// disconnect. Owned by that peer's driver task; the coordinator only sees
/// snapshots taken through shared, lock-protected piece-manager state.
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: [u8; 20],
    pub flags: PeerFlags,
    pub have: Bitfield,
    pub supports_extension_protocol: bool,
    pub supports_dht: bool,
    pub supports_fast_extension: bool,
    /// Extension name -> peer-assigned identifier, learned from the
    /// extended handshake's `m` map.
    pub extensions: HashMap<String, u8>,
    pub pending_requests: HashMap<BlockKey, PendingRequest>,
    pub last_message_at: Instant,
    pub bitfield_received: bool,
}

impl PeerSession {
    pub fn new(peer_id: [u8; 20], num_pieces: usize) -> Self {
        Self {
            peer_id,
            flags: PeerFlags::default(),
            have: Bitfield::new(num_pieces),
            supports_extension_protocol: false,
            supports_dht: false,
            supports_fast_extension: false,
            extensions: HashMap::new(),
            pending_requests: HashMap::new(),
            last_message_at: Instant::now(),
            bitfield_received: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_message_at = Instant::now();
    }

    pub fn is_idle_beyond(&self, limit: Duration, now: Instant) -> bool {
        now.duration_since(self.last_message_at) > limit
    }

    /// Records a REQUEST we just sent; fails if the pipeline is already at
    /// capacity.
    pub fn record_request(&mut self, key: BlockKey, length: u32) -> bool {
        if self.pending_requests.len() >= MAX_PIPELINE_DEPTH {
            return false;
        }
        self.pending_requests.insert(
            key,
            PendingRequest { length, requested_at: Instant::now() },
        );
        true
    }

    /// Removes the matching pending request when its PIECE arrives; returns
    /// whether one was found (an unmatched PIECE is simply ignored).
    pub fn fulfil_request(&mut self, key: BlockKey) -> bool {
        self.pending_requests.remove(&key).is_some()
    }

    /// On CHOKE received, all pending outbound requests are dropped — the
    /// peer is entitled to silently discard them. Returns the keys that were
    /// cleared so the caller can return them to the coordinator for
    /// reassignment.
    pub fn clear_pending_on_choke(&mut self) -> Vec<BlockKey> {
        self.pending_requests.drain().map(|(k, _)| k).collect()
    }

    /// Pending requests that have outlived their deadline.
    pub fn expired_requests(&self, now: Instant) -> Vec<BlockKey> {
        self.pending_requests
            .iter()
            .filter(|(_, req)| req.is_expired(now))
            .map(|(k, _)| *k)
            .collect()
    }
}
