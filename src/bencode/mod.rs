//! Bencode codec: decode/encode of the four Bencode value variants used
//! throughout the BitTorrent wire and file formats.
//!
//! Bencode is commonly used in BitTorrent protocol for encoding metadata.
//! The decoder additionally tracks, for every decoded dictionary, the exact
//! byte range it was parsed from (`Spanned`), which is how the info
//! dictionary's fingerprint can be computed over the torrent file's original
//! bytes rather than a re-encoding of the decoded value.
use std::collections::BTreeMap;
use std::ops::Range;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

/// A Bencode value.
///
/// 1. `String(Vec<u8>)` — a byte string, e.g. `4:spam` -> `String(b"spam")`.
/// 2. `Integer(i64)` — a signed integer, e.g. `i42e` -> `Integer(42)`.
/// 3. `List(Vec<BencodeValue>)` — an ordered sequence, e.g. `li42ee` -> `List([Integer(42)])`.
/// 4. `Dict(BTreeMap<Vec<u8>, BencodeValue>)` — keys are byte strings, stored
///    sorted so encoding is always canonical regardless of insertion order.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_str_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }
}

/// A decoded value together with the exact source byte range it consumed.
///
/// Needed for info-fingerprint stability: the fingerprint must be computed
/// over the original encoded bytes of the `info` subtree, not a
/// re-serialization of the parsed value.
#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub value: T,
    pub span: Range<usize>,
}

/// Custom error type for Bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid bencode format: {0}")]
    InvalidFormat(String),

    #[error("invalid integer literal")]
    InvalidInteger,

    #[error("invalid string length prefix")]
    InvalidStringLength,

    #[error("dictionary keys must be strings")]
    DictKeyNotString,

    #[error("duplicate key in dictionary: {0:?}")]
    DuplicateKey(Vec<u8>),

    #[error("trailing bytes after top-level value")]
    TrailingBytes,

    #[error("cannot encode type: {0}")]
    CannotEncodeType(&'static str),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
