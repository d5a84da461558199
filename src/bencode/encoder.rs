//! Bencode encoding. Always produces the canonical form: integers without
//! leading zeros, dictionary entries ordered by byte-lexicographic key
//! order, strings prefixed with their decimal length.
use super::{BencodeResult, BencodeValue};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

/// `BTreeMap` already iterates in byte-lexicographic key order, so no
/// explicit sort is needed here (the teacher's `HashMap`-based encoder has
/// to `sort_unstable` its collected keys first; this is the equivalent step
/// done once at insertion time instead of once per encode).
#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(writer: &mut W, dict: &BTreeMap<Vec<u8>, BencodeValue>) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` into its canonical bencode representation, writing into
/// `writer`.
#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper that encodes into a freshly allocated `Vec<u8>`.
pub fn encode_to_vec(value: &BencodeValue) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writing into a Vec<u8> never fails.
    encode(&mut buf, value).expect("encoding into a Vec<u8> is infallible");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::decoder::decode;

    #[test]
    fn encodes_canonical_forms() {
        assert_eq!(encode_to_vec(&BencodeValue::Integer(0)), b"i0e");
        assert_eq!(encode_to_vec(&BencodeValue::Integer(-1)), b"i-1e");
        assert_eq!(encode_to_vec(&BencodeValue::String(vec![])), b"0:");
        assert_eq!(encode_to_vec(&BencodeValue::List(vec![])), b"le");
    }

    #[test]
    fn sorts_dict_keys_regardless_of_insertion_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zebra".to_vec(), BencodeValue::Integer(1));
        dict.insert(b"apple".to_vec(), BencodeValue::Integer(2));
        let encoded = encode_to_vec(&BencodeValue::Dict(dict));
        assert_eq!(encoded, b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn round_trips_through_decode() {
        for encoded in [&b"i0e"[..], b"0:", b"le", b"de", b"li1ei2ee"] {
            let decoded = decode(encoded).unwrap().value;
            assert_eq!(encode_to_vec(&decoded), encoded);
        }
    }
}
