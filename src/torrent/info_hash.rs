//! Info-fingerprint computation: the SHA-1 hash of the torrent's `info`
//! subtree.
use super::Fingerprint;
use sha1::{Digest, Sha1};

/// Hashes the exact source bytes of a bencoded `info` subtree.
///
/// Callers must pass the original encoded bytes (as reported by the bencode
/// decoder's span tracking), not a re-encoding of the decoded value — the
/// fingerprint is only stable if it is computed over bytes the remote peer
/// could have produced themselves by encoding the same dictionary in their
/// own (potentially non-canonical) way.
pub fn hash_subtree_bytes(info_bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha1::new();
    hasher.update(info_bytes);
    let digest = hasher.finalize();
    let mut fingerprint = [0u8; 20];
    fingerprint.copy_from_slice(&digest[..]);
    fingerprint
}

/// Hashes an arbitrary byte buffer, used both for piece verification
/// (`hash(piece_bytes) == piece.fingerprint`) and for metadata-exchange
/// assembly verification (`hash(assembled) == magnet.info_fingerprint`).
pub fn hash_bytes(bytes: &[u8]) -> Fingerprint {
    hash_subtree_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_deterministic() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }
}
