//! Tracker clients: shared request/response types plus the HTTP (BEP 3)
//! and UDP (BEP 15) transports.
use std::net::SocketAddr;
use thiserror::Error;

pub mod http;
pub mod udp;

pub use http::HttpTrackerClient;
pub use udp::UdpTrackerClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Stopped,
    Completed,
    /// The periodic re-announce carries no event parameter.
    None,
}

impl Event {
    pub fn as_query_value(&self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Stopped => Some("stopped"),
            Event::Completed => Some("completed"),
            Event::None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval_secs: u64,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("serde_bencode error: {0}")]
    SerdeBencode(#[from] serde_bencode::Error),

    #[error("tracker returned a failure reason: {0}")]
    Failure(String),

    #[error("malformed compact peer list (length not a multiple of 6)")]
    MalformedCompactPeers,

    #[error("malformed tracker response: {0}")]
    MalformedResponse(String),

    #[error("UDP tracker transaction timed out after {0} retries")]
    TransactionTimedOut(u32),

    #[error("UDP tracker returned an error: {0}")]
    UdpError(String),

    #[error("UDP tracker response failed validation: {0}")]
    InvalidResponse(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Generates this client's 20-byte peer id: an 8-byte identifying prefix
/// followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    use rand::Rng;
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT1000-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Percent-encodes a byte slice per RFC 3986, leaving the unreserved set
/// (`A-Z a-z 0-9 - . _ ~`) untouched. Trackers expect raw 20-byte
/// `info_hash`/`peer_id` values encoded this way, not URL-safe base64 or
/// hex.
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_carries_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RT1000-");
    }

    #[test]
    fn url_encode_percent_escapes_reserved_bytes() {
        assert_eq!(url_encode(b"az09-._~"), "az09-._~");
        assert_eq!(url_encode(&[0xff, 0x00]), "%FF%00");
    }
}
