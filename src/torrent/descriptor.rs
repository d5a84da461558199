//! `.torrent` file structure and parsing logic.
//!
//! Defines `TorrentDescriptor` and its helpers for parsing, validating, and
//! working with torrent metadata.
use crate::bencode::{decoder, BencodeValue};
use crate::torrent::info_hash;

use super::{Fingerprint, TorrentError, TorrentResult};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Announce URL(s), name, piece table, and file map of a torrent, immutable
/// once constructed.
#[derive(Debug, PartialEq, Clone)]
pub struct TorrentDescriptor {
    pub announce: String,
    /// Tiered `announce-list`, flattened preserving tier order then
    /// within-tier order; empty if the torrent only carries `announce`.
    pub announce_list: Vec<String>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub name: String,
    pub piece_length: i64,
    pub info_fingerprint: Fingerprint,
    pub piece_fingerprints: Vec<Fingerprint>,
    /// Files laid out contiguously in a virtual linear byte space, in the
    /// order the `files` list (or the single-file `length`) specifies.
    pub files: Vec<FileEntry>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: i64,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub name: String,
    pub files: Vec<FileEntry>,
}

/// Parses the concatenated SHA-1 hashes from the `pieces` byte string.
///
/// The `pieces` key within the `info` dictionary is a single byte string
/// that concatenates a 20-byte fingerprint per piece, in piece-index order.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<Fingerprint>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut fp = [0u8; 20];
            fp.copy_from_slice(chunk);
            fp
        })
        .collect())
}

/// Flattens a tiered `announce-list` (a list of lists of tracker URLs) into
/// an ordered list preserving tier order, then within-tier order.
fn parse_announce_list(value: &BencodeValue) -> TorrentResult<Vec<String>> {
    let tiers = value
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("announce-list not a list".to_string()))?;
    let mut result = Vec::new();
    for tier in tiers {
        let trackers = tier
            .as_list()
            .ok_or_else(|| TorrentError::InvalidFormat("announce tier not a list".to_string()))?;
        for tracker in trackers {
            let bytes = tracker.as_str_bytes().ok_or_else(|| {
                TorrentError::InvalidFormat("tracker URL not a string".to_string())
            })?;
            result.push(String::from_utf8(bytes.to_vec()).map_err(|e| {
                TorrentError::InvalidFormat(format!("invalid tracker URL (not UTF-8): {e}"))
            })?);
        }
    }
    Ok(result)
}

fn parse_info_dict(value: &BencodeValue) -> TorrentResult<InfoDict> {
    let dict = value
        .as_dict()
        .ok_or_else(|| TorrentError::InvalidFormat("info is not a dictionary".to_string()))?;

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(BencodeValue::as_integer)
        .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?;

    let pieces = dict
        .get(b"pieces".as_slice())
        .and_then(BencodeValue::as_str_bytes)
        .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?
        .to_vec();

    let name = dict
        .get(b"name".as_slice())
        .and_then(BencodeValue::as_str_bytes)
        .ok_or_else(|| TorrentError::MissingField("name".to_string()))
        .and_then(|s| {
            String::from_utf8(s.to_vec())
                .map_err(|e| TorrentError::InvalidFormat(format!("invalid name (not UTF-8): {e}")))
        })?;

    let files = match dict.get(b"files".as_slice()) {
        // Multi-file mode: each entry is {length, path: [...]}; paths join
        // with '/' and are prefixed with the torrent name.
        Some(value) => {
            let list = value
                .as_list()
                .ok_or_else(|| TorrentError::InvalidFormat("files is not a list".to_string()))?;
            let mut files = Vec::with_capacity(list.len());
            for entry in list {
                let entry_dict = entry.as_dict().ok_or_else(|| {
                    TorrentError::InvalidFormat("file entry not a dict".to_string())
                })?;
                let length = entry_dict
                    .get(b"length".as_slice())
                    .and_then(BencodeValue::as_integer)
                    .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;
                let path_list = entry_dict
                    .get(b"path".as_slice())
                    .and_then(BencodeValue::as_list)
                    .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
                let mut path = PathBuf::from(&name);
                for component in path_list {
                    let bytes = component.as_str_bytes().ok_or_else(|| {
                        TorrentError::InvalidFormat("path component not a string".to_string())
                    })?;
                    let component = String::from_utf8(bytes.to_vec()).map_err(|e| {
                        TorrentError::InvalidFormat(format!("invalid path component: {e}"))
                    })?;
                    path.push(component);
                }
                files.push(FileEntry { path, length });
            }
            files
        }
        // Single-file mode: a top-level `length`.
        None => {
            let length = dict
                .get(b"length".as_slice())
                .and_then(BencodeValue::as_integer)
                .ok_or_else(|| TorrentError::MissingField("length".to_string()))?;
            vec![FileEntry {
                path: PathBuf::from(&name),
                length,
            }]
        }
    };

    Ok(InfoDict {
        piece_length,
        pieces,
        name,
        files,
    })
}

impl TorrentDescriptor {
    /// Total length of all files, summed across the virtual linear byte
    /// space.
    pub fn total_length(&self) -> i64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// `ceil(total_length / piece_length)`, consistent with the piece
    /// fingerprint table length.
    pub fn num_pieces(&self) -> usize {
        self.piece_fingerprints.len()
    }

    /// Nominal size of piece `index`: `piece_length` except for the last
    /// piece, which is `total_length mod piece_length` (or a full piece when
    /// that remainder is zero).
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            return self.piece_length;
        }
        let total_length = self.total_length();
        let full_pieces_length = (self.num_pieces() - 1) as i64 * self.piece_length;
        let remainder = total_length - full_pieces_length;
        if remainder == 0 {
            self.piece_length
        } else {
            remainder
        }
    }

    /// Returns the paths of files whose byte range overlaps piece `index`'s
    /// byte range in the virtual linear byte space.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = index as i64 * self.piece_length;
        let piece_end = piece_start + self.piece_size(index);
        let mut position = 0i64;
        let mut paths = Vec::new();
        for file in &self.files {
            let file_start = position;
            let file_end = file_start + file.length;
            if file_end > piece_start && file_start < piece_end {
                paths.push(file.path.clone());
            }
            position = file_end;
        }
        paths
    }

    /// Parses a `.torrent` file's raw bytes into a `TorrentDescriptor`.
    ///
    /// The info-fingerprint is computed over the exact source bytes of the
    /// `info` subtree (as reported by the bencode decoder's span tracking),
    /// not a re-encoding of the decoded value, so it is stable regardless of
    /// decoder internals.
    /// Builds a descriptor from a magnet's announce URL (possibly empty) and
    /// the raw `info` dictionary bytes assembled via `ut_metadata`. Wraps
    /// them into a synthetic top-level torrent dict so the same byte-span
    /// machinery `parse` relies on for info-fingerprint stability applies
    /// unchanged.
    pub fn from_metadata(announce: &str, info_bytes: &[u8]) -> TorrentResult<Self> {
        let mut wrapped = Vec::with_capacity(info_bytes.len() + announce.len() + 32);
        wrapped.extend_from_slice(b"d8:announce");
        wrapped.extend_from_slice(format!("{}:", announce.len()).as_bytes());
        wrapped.extend_from_slice(announce.as_bytes());
        wrapped.extend_from_slice(b"4:info");
        wrapped.extend_from_slice(info_bytes);
        wrapped.push(b'e');
        Self::parse(&wrapped)
    }

    pub fn parse(data: &[u8]) -> TorrentResult<Self> {
        let (spanned, info_span) = decoder::decode_with_subtree_span(data, b"info")?;
        let dict = spanned
            .value
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("root is not a dictionary".to_string()))?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(BencodeValue::as_str_bytes)
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))
            .and_then(|s| {
                String::from_utf8(s.to_vec()).map_err(|e| {
                    TorrentError::InvalidFormat(format!("invalid announce URL: {e}"))
                })
            })?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info = parse_info_dict(info_value)?;

        let announce_list = match dict.get(b"announce-list".as_slice()) {
            Some(value) => parse_announce_list(value)?,
            None => Vec::new(),
        };

        let creation_date = match dict.get(b"creation date".as_slice()) {
            Some(value) => {
                let timestamp = value
                    .as_integer()
                    .ok_or_else(|| TorrentError::InvalidFormat("creation date not an integer".to_string()))?;
                let secs: u64 = timestamp.try_into().map_err(|_| TorrentError::DateParseError)?;
                Some(UNIX_EPOCH + std::time::Duration::from_secs(secs))
            }
            None => None,
        };

        let comment = dict
            .get(b"comment".as_slice())
            .and_then(BencodeValue::as_str_bytes)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        let created_by = dict
            .get(b"created by".as_slice())
            .and_then(BencodeValue::as_str_bytes)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();

        let info_span = info_span.ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        let info_fingerprint = info_hash::hash_subtree_bytes(&data[info_span]);
        let piece_fingerprints = parse_pieces(&info.pieces)?;

        Ok(TorrentDescriptor {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            name: info.name,
            piece_length: info.piece_length,
            info_fingerprint,
            piece_fingerprints,
            files: info.files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode_to_vec;
    use std::collections::BTreeMap;

    fn single_file_torrent(piece_length: i64, total_length: i64) -> Vec<u8> {
        let num_pieces = ((total_length + piece_length - 1) / piece_length).max(1) as usize;
        let mut pieces = Vec::new();
        for i in 0..num_pieces {
            pieces.extend(std::iter::repeat(i as u8).take(20));
        }
        let mut info = BTreeMap::new();
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(pieces));
        info.insert(b"name".to_vec(), BencodeValue::String(b"demo.bin".to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(total_length));

        let mut root = BTreeMap::new();
        root.insert(
            b"announce".to_vec(),
            BencodeValue::String(b"http://tracker.example/announce".to_vec()),
        );
        root.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encode_to_vec(&BencodeValue::Dict(root))
    }

    #[test]
    fn parses_single_file_torrent_and_piece_count() {
        let bytes = single_file_torrent(16384, 16384 * 3 + 100);
        let descriptor = TorrentDescriptor::parse(&bytes).unwrap();
        assert_eq!(descriptor.num_pieces(), 4);
        assert_eq!(descriptor.piece_size(3), 100);
        assert_eq!(descriptor.piece_size(0), 16384);
        assert_eq!(descriptor.total_length(), 16384 * 3 + 100);
    }

    #[test]
    fn from_metadata_wraps_raw_info_bytes_into_a_parseable_descriptor() {
        let bytes = single_file_torrent(16384, 16384);
        let (spanned, span) = decoder::decode_with_subtree_span(&bytes, b"info").unwrap();
        let _ = spanned;
        let info_bytes = &bytes[span.unwrap()];

        let descriptor = TorrentDescriptor::from_metadata("http://tracker.example/announce", info_bytes).unwrap();
        assert_eq!(descriptor.num_pieces(), 1);
        assert_eq!(descriptor.announce, "http://tracker.example/announce");
    }

    #[test]
    fn last_piece_is_full_when_total_length_is_multiple() {
        let bytes = single_file_torrent(16384, 16384 * 2);
        let descriptor = TorrentDescriptor::parse(&bytes).unwrap();
        assert_eq!(descriptor.num_pieces(), 2);
        assert_eq!(descriptor.piece_size(1), 16384);
    }

    #[test]
    fn info_fingerprint_is_stable_regardless_of_surrounding_fields() {
        let bytes_a = single_file_torrent(16384, 16384);
        // Re-parse then re-encode just the info subtree and hash independently.
        let (spanned, span) =
            decoder::decode_with_subtree_span(&bytes_a, b"info").unwrap();
        let _ = spanned;
        let span = span.unwrap();
        let expected = info_hash::hash_subtree_bytes(&bytes_a[span]);
        let descriptor = TorrentDescriptor::parse(&bytes_a).unwrap();
        assert_eq!(descriptor.info_fingerprint, expected);
    }
}
