//! Bencode decoding.
//!
//! Unlike a stream-oriented decoder, this one walks a `&[u8]` slice with a
//! cursor so that every decoded dictionary can report the exact byte range
//! it was parsed from (see [`Spanned`]). That range is what
//! `torrent::info_hash` hashes to get the info-fingerprint, instead of
//! re-encoding the parsed value.
use super::{BencodeError, BencodeResult, BencodeValue, Spanned};
use std::collections::BTreeMap;
use tracing::instrument;

/// A cursor over the input bytes, tracking the current read position.
struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&self) -> BencodeResult<u8> {
        self.input.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn next(&mut self) -> BencodeResult<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, byte: u8) -> BencodeResult<()> {
        let b = self.next()?;
        if b != byte {
            return Err(BencodeError::InvalidFormat(format!(
                "expected '{}', found '{}'",
                byte as char, b as char
            )));
        }
        Ok(())
    }

    /// Reads bytes up to (and consuming) `delimiter`, returning them as a
    /// UTF-8 string. Used for integer literals and string length prefixes,
    /// both of which must be ASCII decimal digits.
    fn read_until(&mut self, delimiter: u8) -> BencodeResult<String> {
        let start = self.pos;
        loop {
            let b = self.peek()?;
            if b == delimiter {
                let s = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|e| {
                        BencodeError::InvalidFormat(format!(
                            "non-UTF8 characters in length/integer: {e}"
                        ))
                    })?
                    .to_string();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
    }
}

/// Decodes a bencode string in the format `<length>:<data>`.
///
/// `<length>` must be an unsigned decimal with no leading zeros (other than
/// the literal value `0`); `<data>` follows the colon and must be exactly
/// `<length>` bytes long.
#[instrument(skip(cursor), level = "trace")]
fn decode_string(cursor: &mut Cursor) -> BencodeResult<Vec<u8>> {
    let length_str = cursor.read_until(b':')?;
    if length_str.len() > 1 && length_str.starts_with('0') {
        return Err(BencodeError::InvalidStringLength);
    }
    if !length_str.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidStringLength);
    }
    let length = length_str
        .parse::<usize>()
        .map_err(|_| BencodeError::InvalidStringLength)?;

    let start = cursor.pos;
    let end = start
        .checked_add(length)
        .ok_or(BencodeError::InvalidStringLength)?;
    if end > cursor.input.len() {
        return Err(BencodeError::UnexpectedEof);
    }
    let bytes = cursor.input[start..end].to_vec();
    cursor.pos = end;
    Ok(bytes)
}

/// Decodes a bencode integer in the format `i<number>e`.
///
/// Rejects leading-zero literals (`i01e`), `-0`, and empty literals (`ie`),
/// per the Bencode grammar's canonical-form requirement.
#[instrument(skip(cursor), level = "trace")]
fn decode_integer(cursor: &mut Cursor) -> BencodeResult<i64> {
    cursor.expect(b'i')?;
    let num_str = cursor.read_until(b'e')?;

    if num_str.is_empty() {
        return Err(BencodeError::InvalidInteger);
    }
    if num_str == "-0" {
        return Err(BencodeError::InvalidInteger);
    }
    let digits = num_str.strip_prefix('-').unwrap_or(&num_str);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BencodeError::InvalidInteger);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(BencodeError::InvalidInteger);
    }

    num_str.parse::<i64>().map_err(|_| BencodeError::InvalidInteger)
}

/// Decodes a bencode list `l<items>e`, recursively decoding each item.
#[instrument(skip(cursor), level = "trace")]
fn decode_list(cursor: &mut Cursor) -> BencodeResult<Vec<BencodeValue>> {
    cursor.expect(b'l')?;
    let mut list = Vec::new();
    loop {
        if cursor.peek()? == b'e' {
            cursor.pos += 1;
            break;
        }
        list.push(decode_next(cursor)?.value);
    }
    Ok(list)
}

/// Decodes a bencode dictionary `d<key><value>...e`.
///
/// Keys must themselves be bencode strings and must not repeat; a repeated
/// key is `malformed` per the spec rather than a silent overwrite.
#[instrument(skip(cursor), level = "trace")]
fn decode_dict(cursor: &mut Cursor) -> BencodeResult<BTreeMap<Vec<u8>, BencodeValue>> {
    cursor.expect(b'd')?;
    let mut dict = BTreeMap::new();
    loop {
        if cursor.peek()? == b'e' {
            cursor.pos += 1;
            break;
        }
        if !cursor.peek()?.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }
        let key = decode_string(cursor)?;
        let value = decode_next(cursor)?.value;
        if dict.insert(key.clone(), value).is_some() {
            return Err(BencodeError::DuplicateKey(key));
        }
    }
    Ok(dict)
}

#[instrument(skip(cursor), level = "trace")]
fn decode_next(cursor: &mut Cursor) -> BencodeResult<Spanned<BencodeValue>> {
    let start = cursor.pos;
    let first_byte = cursor.peek()?;
    let value = match first_byte {
        b'0'..=b'9' => BencodeValue::String(decode_string(cursor)?),
        b'i' => BencodeValue::Integer(decode_integer(cursor)?),
        b'l' => BencodeValue::List(decode_list(cursor)?),
        b'd' => BencodeValue::Dict(decode_dict(cursor)?),
        other => {
            return Err(BencodeError::InvalidFormat(format!(
                "unexpected character: {}",
                other as char
            )))
        }
    };
    Ok(Spanned {
        value,
        span: start..cursor.pos,
    })
}

/// Decodes a single top-level bencode value from `input`, returning the
/// value along with the byte range it consumed (always `0..input.len()` for
/// well-formed input with no trailing bytes).
#[instrument(skip(input), level = "debug")]
pub fn decode(input: &[u8]) -> BencodeResult<Spanned<BencodeValue>> {
    let mut cursor = Cursor::new(input);
    let spanned = decode_next(&mut cursor)?;
    if cursor.pos != input.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(spanned)
}

/// Decodes a single top-level bencode value, also returning the span of a
/// named top-level dictionary key (used to locate the `info` subtree inside
/// a `.torrent` file without re-encoding it).
///
/// Returns `None` for `key_span_of` if the top-level value is not a
/// dictionary or does not contain that key.
pub fn decode_with_subtree_span(
    input: &[u8],
    key_span_of: &[u8],
) -> BencodeResult<(Spanned<BencodeValue>, Option<std::ops::Range<usize>>)> {
    let mut cursor = Cursor::new(input);
    let start = cursor.pos;
    cursor.expect(b'd')?;
    let mut dict = BTreeMap::new();
    let mut key_span = None;
    loop {
        if cursor.peek()? == b'e' {
            cursor.pos += 1;
            break;
        }
        if !cursor.peek()?.is_ascii_digit() {
            return Err(BencodeError::DictKeyNotString);
        }
        let key = decode_string(&mut cursor)?;
        let value_spanned = decode_next(&mut cursor)?;
        if key == key_span_of {
            key_span = Some(value_spanned.span.clone());
        }
        if dict.insert(key.clone(), value_spanned.value).is_some() {
            return Err(BencodeError::DuplicateKey(key));
        }
    }
    if cursor.pos != input.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok((
        Spanned {
            value: BencodeValue::Dict(dict),
            span: start..cursor.pos,
        },
        key_span,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encoder::encode;

    fn dv(v: BencodeValue) -> BencodeResult<BencodeValue> {
        decode(&encode_to_vec(&v)).map(|s| s.value)
    }

    fn encode_to_vec(v: &BencodeValue) -> Vec<u8> {
        let mut buf = Vec::new();
        encode(&mut buf, v).unwrap();
        buf
    }

    #[test]
    fn decodes_edge_case_integers() {
        assert_eq!(decode(b"i0e").unwrap().value, BencodeValue::Integer(0));
        assert_eq!(decode(b"i-1e").unwrap().value, BencodeValue::Integer(-1));
        assert!(decode(b"i-0e").is_err());
        assert!(decode(b"i01e").is_err());
        assert!(decode(b"ie").is_err());
    }

    #[test]
    fn decodes_edge_case_collections() {
        assert_eq!(decode(b"0:").unwrap().value, BencodeValue::String(vec![]));
        assert_eq!(decode(b"le").unwrap().value, BencodeValue::List(vec![]));
        assert_eq!(
            decode(b"de").unwrap().value,
            BencodeValue::Dict(BTreeMap::new())
        );
    }

    #[test]
    fn rejects_unterminated_and_duplicate_keys() {
        assert!(decode(b"l4:spam").is_err());
        assert!(decode(b"d1:ai1e1:ai2ee").is_err());
    }

    #[test]
    fn round_trips_nested_values() {
        let mut inner = BTreeMap::new();
        inner.insert(b"a".to_vec(), BencodeValue::Integer(1));
        inner.insert(b"b".to_vec(), BencodeValue::String(b"x".to_vec()));
        let value = BencodeValue::List(vec![BencodeValue::Dict(inner), BencodeValue::Integer(7)]);
        assert_eq!(dv(value.clone()).unwrap(), value);
    }

    #[test]
    fn reports_span_of_named_subtree() {
        let input = b"d4:infod4:name4:demoee";
        let (_, span) = decode_with_subtree_span(input, b"info").unwrap();
        let span = span.unwrap();
        assert_eq!(&input[span], &b"d4:name4:demoe"[..]);
    }
}
