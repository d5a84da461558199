//! Extension protocol (BEP 10): the extended handshake and the
//! `ut_metadata` (BEP 9) metadata-exchange extension built on top of it.
use super::{PeerError, PeerResult};
use crate::bencode::decoder::decode;
use crate::bencode::encoder::encode_to_vec;
use crate::bencode::BencodeValue;
use crate::torrent::{info_hash, Fingerprint};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Local extension id we assign to `ut_metadata` in our own extended
/// handshake's `m` map.
pub const UT_METADATA_LOCAL_ID: u8 = 1;
pub const UT_METADATA_NAME: &str = "ut_metadata";

/// A 16 KiB block of the bencoded `info` subtree, as exchanged by
/// `ut_metadata`.
pub const METADATA_BLOCK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedHandshake {
    /// Extension name -> the *sender's* local id for it.
    pub m: HashMap<String, u8>,
    pub metadata_size: Option<i64>,
    pub version: Option<String>,
    pub port: Option<u16>,
}

impl ExtendedHandshake {
    pub fn supporting_ut_metadata(metadata_size: Option<i64>) -> Self {
        let mut m = HashMap::new();
        m.insert(UT_METADATA_NAME.to_string(), UT_METADATA_LOCAL_ID);
        Self { m, metadata_size, version: Some(format!("rs-torrent-client {}", env!("CARGO_PKG_VERSION"))), port: None }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut m_dict = BTreeMap::new();
        for (name, id) in &self.m {
            m_dict.insert(name.as_bytes().to_vec(), BencodeValue::Integer(*id as i64));
        }
        let mut root = BTreeMap::new();
        root.insert(b"m".to_vec(), BencodeValue::Dict(m_dict));
        if let Some(size) = self.metadata_size {
            root.insert(b"metadata_size".to_vec(), BencodeValue::Integer(size));
        }
        if let Some(v) = &self.version {
            root.insert(b"v".to_vec(), BencodeValue::String(v.as_bytes().to_vec()));
        }
        if let Some(port) = self.port {
            root.insert(b"p".to_vec(), BencodeValue::Integer(port as i64));
        }
        encode_to_vec(&BencodeValue::Dict(root))
    }

    pub fn decode(bytes: &[u8]) -> PeerResult<Self> {
        let spanned = decode(bytes)?;
        let dict = spanned
            .value
            .as_dict()
            .ok_or_else(|| PeerError::MalformedPayload(0))?;

        let mut m = HashMap::new();
        if let Some(m_value) = dict.get(b"m".as_slice()).and_then(BencodeValue::as_dict) {
            for (name, id) in m_value {
                if let Some(id) = id.as_integer() {
                    m.insert(String::from_utf8_lossy(name).into_owned(), id as u8);
                }
            }
        }
        let metadata_size = dict.get(b"metadata_size".as_slice()).and_then(BencodeValue::as_integer);
        let version = dict
            .get(b"v".as_slice())
            .and_then(BencodeValue::as_str_bytes)
            .map(|s| String::from_utf8_lossy(s).into_owned());
        let port = dict
            .get(b"p".as_slice())
            .and_then(BencodeValue::as_integer)
            .map(|p| p as u16);

        Ok(Self { m, metadata_size, version, port })
    }

    pub fn peer_ut_metadata_id(&self) -> Option<u8> {
        self.m.get(UT_METADATA_NAME).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u32, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut header = BTreeMap::new();
        match self {
            MetadataMessage::Request { piece } => {
                header.insert(b"msg_type".to_vec(), BencodeValue::Integer(0));
                header.insert(b"piece".to_vec(), BencodeValue::Integer(*piece as i64));
                encode_to_vec(&BencodeValue::Dict(header))
            }
            MetadataMessage::Data { piece, total_size, data } => {
                header.insert(b"msg_type".to_vec(), BencodeValue::Integer(1));
                header.insert(b"piece".to_vec(), BencodeValue::Integer(*piece as i64));
                header.insert(b"total_size".to_vec(), BencodeValue::Integer(*total_size as i64));
                let mut bytes = encode_to_vec(&BencodeValue::Dict(header));
                bytes.extend_from_slice(data);
                bytes
            }
            MetadataMessage::Reject { piece } => {
                header.insert(b"msg_type".to_vec(), BencodeValue::Integer(2));
                header.insert(b"piece".to_vec(), BencodeValue::Integer(*piece as i64));
                encode_to_vec(&BencodeValue::Dict(header))
            }
        }
    }

    /// Decodes a message, where `raw` is the EXTENDED payload *after* the
    /// one-byte ext_id. The DATA variant's trailing raw piece bytes follow
    /// the bencoded header in the same buffer, so we track where the header
    /// ended using span-aware decoding.
    pub fn decode(raw: &[u8]) -> PeerResult<Self> {
        let spanned = decode(raw)?;
        let dict = spanned.value.as_dict().ok_or_else(|| PeerError::MalformedPayload(20))?;
        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(BencodeValue::as_integer)
            .ok_or(PeerError::MalformedPayload(20))?;
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(BencodeValue::as_integer)
            .ok_or(PeerError::MalformedPayload(20))? as u32;

        match msg_type {
            0 => Ok(MetadataMessage::Request { piece }),
            1 => {
                let total_size = dict
                    .get(b"total_size".as_slice())
                    .and_then(BencodeValue::as_integer)
                    .ok_or(PeerError::MalformedPayload(20))? as u32;
                let data = raw[spanned.span.end..].to_vec();
                Ok(MetadataMessage::Data { piece, total_size, data })
            }
            2 => Ok(MetadataMessage::Reject { piece }),
            _ => Err(PeerError::MalformedPayload(20)),
        }
    }
}

/// Assembles the `info` subtree byte-by-byte from `ut_metadata` DATA
/// messages, as used when starting a download from a magnet link.
#[derive(Debug)]
pub struct MetadataAssembler {
    total_size: usize,
    blocks: Vec<Option<Vec<u8>>>,
    expected_fingerprint: Fingerprint,
}

impl MetadataAssembler {
    pub fn new(total_size: usize, expected_fingerprint: Fingerprint) -> Self {
        let num_blocks = total_size.div_ceil(METADATA_BLOCK_SIZE);
        Self { total_size, blocks: vec![None; num_blocks], expected_fingerprint }
    }

    pub fn num_pieces(&self) -> usize {
        self.blocks.len()
    }

    pub fn missing_pieces(&self) -> Vec<u32> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_none())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn accept(&mut self, piece: u32, data: Vec<u8>) -> PeerResult<()> {
        let index = piece as usize;
        if index >= self.blocks.len() {
            return Err(PeerError::MalformedPayload(20));
        }
        self.blocks[index] = Some(data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(Option::is_some)
    }

    /// Assembles and verifies the metadata once every block has arrived.
    /// Returns `Ok(None)` while blocks are still outstanding, the verified
    /// bytes on success, and `MetadataFingerprintMismatch` if the assembled
    /// bytes don't hash to the expected fingerprint (callers should discard
    /// and re-request all pieces in that case).
    pub fn try_finish(&self) -> PeerResult<Option<Vec<u8>>> {
        if !self.is_complete() {
            return Ok(None);
        }
        let mut assembled = Vec::with_capacity(self.total_size);
        for block in &self.blocks {
            assembled.extend_from_slice(block.as_ref().unwrap());
        }
        assembled.truncate(self.total_size);
        if info_hash::hash_bytes(&assembled) != self.expected_fingerprint {
            return Err(PeerError::MetadataFingerprintMismatch);
        }
        Ok(Some(assembled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_handshake_round_trips_ut_metadata_advertisement() {
        let handshake = ExtendedHandshake::supporting_ut_metadata(Some(12345));
        let encoded = handshake.encode();
        let decoded = ExtendedHandshake::decode(&encoded).unwrap();
        assert_eq!(decoded.metadata_size, Some(12345));
        assert_eq!(decoded.peer_ut_metadata_id(), Some(UT_METADATA_LOCAL_ID));
    }

    #[test]
    fn metadata_message_round_trips_request_and_reject() {
        assert_eq!(
            MetadataMessage::decode(&MetadataMessage::Request { piece: 3 }.encode()).unwrap(),
            MetadataMessage::Request { piece: 3 }
        );
        assert_eq!(
            MetadataMessage::decode(&MetadataMessage::Reject { piece: 1 }.encode()).unwrap(),
            MetadataMessage::Reject { piece: 1 }
        );
    }

    #[test]
    fn metadata_message_data_preserves_trailing_raw_bytes() {
        let data = vec![1u8, 2, 3, 4, 5];
        let encoded = MetadataMessage::Data { piece: 0, total_size: 5, data: data.clone() }.encode();
        match MetadataMessage::decode(&encoded).unwrap() {
            MetadataMessage::Data { data: decoded, .. } => assert_eq!(decoded, data),
            other => panic!("expected Data, got {other:?}"),
        }
    }

    #[test]
    fn assembler_verifies_fingerprint_on_completion() {
        let info_bytes = b"d4:name4:demoe".to_vec();
        let fingerprint = info_hash::hash_bytes(&info_bytes);
        let mut assembler = MetadataAssembler::new(info_bytes.len(), fingerprint);
        assert!(assembler.try_finish().unwrap().is_none());
        assembler.accept(0, info_bytes.clone()).unwrap();
        assert_eq!(assembler.try_finish().unwrap(), Some(info_bytes));
    }

    #[test]
    fn assembler_rejects_mismatched_assembly() {
        let mut assembler = MetadataAssembler::new(5, [0u8; 20]);
        assembler.accept(0, vec![1, 2, 3, 4, 5]).unwrap();
        assert!(matches!(assembler.try_finish(), Err(PeerError::MetadataFingerprintMismatch)));
    }
}
