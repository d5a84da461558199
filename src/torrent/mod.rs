//! Torrent and magnet descriptor parsing and error handling.
//!
//! This module provides the types and error handling for working with
//! `.torrent` files and magnet URIs: parsing, validation, and info-fingerprint
//! computation.
use thiserror::Error;

pub mod descriptor;
pub mod info_hash;
pub mod magnet;

pub use descriptor::{FileEntry, InfoDict, TorrentDescriptor};
pub use magnet::MagnetDescriptor;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("missing or invalid field: {0}")]
    MissingField(String),

    #[error("invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("date parse error")]
    DateParseError,

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("magnet URI error: {0}")]
    Magnet(#[from] MagnetError),

    #[error("info-fingerprint mismatch: assembled metadata does not match magnet hash")]
    InfoFingerprintMismatch,
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MagnetError {
    #[error("magnet URI missing required 'xt' parameter")]
    MissingExactTopic,

    #[error("unsupported 'xt' namespace: {0}")]
    UnsupportedTopic(String),

    #[error("invalid info-hash encoding (expected 40 hex or 32 base32 chars): {0}")]
    InvalidInfoHash(String),

    #[error("not a magnet URI (missing 'magnet:?' prefix)")]
    NotAMagnetUri,
}

/// Result type for torrent operations.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;

/// A 20-byte cryptographic fingerprint: either the info-fingerprint of a
/// torrent (hash of the canonically bencoded `info` subtree) or a single
/// piece's fingerprint extracted from the `pieces` table.
pub type Fingerprint = [u8; 20];
