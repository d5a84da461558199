//! Magnet URI parsing (BEP 9).
//!
//! Format: `magnet:?xt=urn:btih:<info-hash>&dn=<name>&tr=<tracker>...`.
//! Produces a descriptor missing the piece-length and piece-fingerprint
//! table; those are filled in later via the metadata-exchange extension
//! (`peer::extension::metadata`).
use super::{Fingerprint, MagnetError};

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MagnetDescriptor {
    pub info_fingerprint: Fingerprint,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    pub exact_length: Option<i64>,
}

impl MagnetDescriptor {
    /// Parses a magnet URI. Recognized keys: `xt` (required,
    /// `urn:btih:<hash>`), `dn`, `tr` (repeatable), `ws` (repeatable), `xl`.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let query = uri.strip_prefix("magnet:?").ok_or(MagnetError::NotAMagnetUri)?;

        let mut info_fingerprint = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut web_seeds = Vec::new();
        let mut exact_length = None;

        for param in query.split('&') {
            if param.is_empty() {
                continue;
            }
            let Some((key, raw_value)) = param.split_once('=') else {
                continue;
            };
            let value = url_decode(raw_value);

            match key {
                "xt" => {
                    let hash_str = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| MagnetError::UnsupportedTopic(value.clone()))?;
                    info_fingerprint = Some(parse_info_hash(hash_str)?);
                }
                "dn" => display_name = Some(value),
                "tr" => trackers.push(value),
                "ws" => web_seeds.push(value),
                "xl" => exact_length = value.parse::<i64>().ok(),
                _ => {}
            }
        }

        Ok(MagnetDescriptor {
            info_fingerprint: info_fingerprint.ok_or(MagnetError::MissingExactTopic)?,
            display_name,
            trackers,
            web_seeds,
            exact_length,
        })
    }
}

/// Decodes percent-encoding and `+`-as-space, mirroring the tracker client's
/// `url_encode` counterpart.
fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 3 <= bytes.len() => {
                if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses a 40-char hex or 32-char base32 info-hash string.
fn parse_info_hash(hash_str: &str) -> Result<Fingerprint, MagnetError> {
    let cleaned: String = hash_str.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() == 40 {
        let bytes = hex::decode(&cleaned)
            .map_err(|_| MagnetError::InvalidInfoHash(cleaned.clone()))?;
        let mut fp = [0u8; 20];
        fp.copy_from_slice(&bytes);
        Ok(fp)
    } else if cleaned.len() == 32 {
        decode_base32(&cleaned).ok_or_else(|| MagnetError::InvalidInfoHash(cleaned.clone()))
    } else {
        Err(MagnetError::InvalidInfoHash(cleaned))
    }
}

/// Decodes a 32-character unpadded base32 (RFC 4648) string into 20 bytes.
fn decode_base32(input: &str) -> Option<Fingerprint> {
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0u32;
    let mut out = Vec::with_capacity(20);

    for c in input.chars() {
        let upper = c.to_ascii_uppercase();
        let value = BASE32_ALPHABET.iter().position(|&b| b == upper as u8)? as u64;
        buffer = (buffer << 5) | value;
        bits_in_buffer += 5;
        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            out.push(((buffer >> bits_in_buffer) & 0xFF) as u8);
        }
    }

    if out.len() != 20 {
        return None;
    }
    let mut fp = [0u8; 20];
    fp.copy_from_slice(&out);
    Some(fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_magnet_without_trackers() {
        let uri = "magnet:?xt=urn:btih:0102030405060708090a0b0c0d0e0f1011121314&dn=demo";
        let magnet = MagnetDescriptor::parse(uri).unwrap();
        assert_eq!(
            magnet.info_fingerprint,
            [
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
                0x0e, 0x0f, 0x10, 0x11, 0x12, 0x13, 0x14
            ]
        );
        assert_eq!(magnet.display_name.as_deref(), Some("demo"));
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn parses_repeated_tr_and_ws() {
        let uri = "magnet:?xt=urn:btih:0102030405060708090a0b0c0d0e0f1011121314&tr=http%3A%2F%2Fa&tr=http%3A%2F%2Fb&ws=http%3A%2F%2Fc";
        let magnet = MagnetDescriptor::parse(uri).unwrap();
        assert_eq!(magnet.trackers, vec!["http://a", "http://b"]);
        assert_eq!(magnet.web_seeds, vec!["http://c"]);
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(MagnetDescriptor::parse("magnet:?dn=demo").is_err());
    }

    #[test]
    fn rejects_non_magnet_uri() {
        assert!(MagnetDescriptor::parse("http://example/").is_err());
    }

    #[test]
    fn base32_info_hash_round_trips_against_hex() {
        let hex_uri = "magnet:?xt=urn:btih:0102030405060708090a0b0c0d0e0f1011121314";
        let hex_magnet = MagnetDescriptor::parse(hex_uri).unwrap();
        // Base32 of the same 20 bytes, computed with the alphabet above.
        let base32 = encode_base32(&hex_magnet.info_fingerprint);
        let base32_uri = format!("magnet:?xt=urn:btih:{base32}");
        let base32_magnet = MagnetDescriptor::parse(&base32_uri).unwrap();
        assert_eq!(base32_magnet.info_fingerprint, hex_magnet.info_fingerprint);
    }

    fn encode_base32(bytes: &[u8]) -> String {
        let mut buffer: u64 = 0;
        let mut bits_in_buffer = 0u32;
        let mut out = String::new();
        for &b in bytes {
            buffer = (buffer << 8) | b as u64;
            bits_in_buffer += 8;
            while bits_in_buffer >= 5 {
                bits_in_buffer -= 5;
                let idx = ((buffer >> bits_in_buffer) & 0x1F) as usize;
                out.push(BASE32_ALPHABET[idx] as char);
            }
        }
        if bits_in_buffer > 0 {
            let idx = ((buffer << (5 - bits_in_buffer)) & 0x1F) as usize;
            out.push(BASE32_ALPHABET[idx] as char);
        }
        out
    }
}
