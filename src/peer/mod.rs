//! Peer wire protocol: handshake, framed messages, per-peer session state,
//! the extension protocol, and the per-peer connection driver task.
use thiserror::Error;

pub mod bitfield;
pub mod connection;
pub mod extension;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use connection::{ConnectionCommand, ConnectionEvent, PeerConnection};
pub use handshake::Handshake;
pub use message::Message;
pub use session::{PeerFlags, PeerSession};

/// Maximum accepted framed-message length; larger frames close the connection.
pub const MAX_FRAME_LEN: u32 = 256 * 1024;

/// Block size used throughout request pipelining and metadata exchange.
pub const BLOCK_SIZE: u32 = 16 * 1024;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid protocol identifier length: {0}")]
    InvalidProtocolLength(u8),

    #[error("unrecognized protocol string: {0:?}")]
    UnrecognizedProtocol(Vec<u8>),

    #[error("info-fingerprint mismatch: peer is serving a different torrent")]
    InfoFingerprintMismatch,

    #[error("frame length {0} exceeds the 256 KiB maximum")]
    FrameTooLarge(u32),

    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    #[error("malformed message payload for id {0}")]
    MalformedPayload(u8),

    #[error("BITFIELD received after the first post-handshake message")]
    LateBitfield,

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("extension {0:?} not supported by this peer")]
    ExtensionUnsupported(String),

    #[error("info-fingerprint mismatch: assembled metadata does not match magnet hash")]
    MetadataFingerprintMismatch,
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
