//! The 68-byte handshake exchanged before any framed message.
//!
//! ```text
//! [1 byte = 19]["BitTorrent protocol" = 19 bytes][8 reserved bytes]
//! [20-byte info-fingerprint][20-byte peer identifier]
//! ```
use super::{PeerError, PeerResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Bit position 20 (counting from byte 0, bit 7, as bit 0): byte 2, the
/// 0x10 mask — extension-protocol (BEP 10) support.
const EXTENSION_PROTOCOL_BYTE: usize = 5;
const EXTENSION_PROTOCOL_MASK: u8 = 0x10;

/// Bit position 63, the last bit of the reserved bytes: DHT (BEP 5) port
/// announcement support.
const DHT_BYTE: usize = 7;
const DHT_MASK: u8 = 0x01;

/// Bits 60-63 overlap the Fast Extension (BEP 6) signal; we use bit 61,
/// the convention several mainline clients settled on.
const FAST_EXTENSION_BYTE: usize = 7;
const FAST_EXTENSION_MASK: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_fingerprint: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Builds a handshake advertising extension-protocol and DHT support
    /// (the only two bits this client ever sets on outbound handshakes).
    pub fn new(info_fingerprint: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_MASK;
        reserved[DHT_BYTE] |= DHT_MASK;
        Self { reserved, info_fingerprint, peer_id }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_MASK != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[DHT_BYTE] & DHT_MASK != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[FAST_EXTENSION_BYTE] & FAST_EXTENSION_MASK != 0
    }

    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_fingerprint);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    fn deserialize(buf: &[u8; 67], protocol_len: u8) -> PeerResult<Self> {
        if protocol_len != 19 {
            return Err(PeerError::InvalidProtocolLength(protocol_len));
        }
        if &buf[0..19] != PROTOCOL {
            return Err(PeerError::UnrecognizedProtocol(buf[0..19].to_vec()));
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[19..27]);
        let mut info_fingerprint = [0u8; 20];
        info_fingerprint.copy_from_slice(&buf[27..47]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[47..67]);
        Ok(Self { reserved, info_fingerprint, peer_id })
    }

    /// Writes this handshake to the stream.
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> PeerResult<()> {
        writer.write_all(&self.serialize()).await?;
        Ok(())
    }

    /// Reads and validates a handshake from the stream. Does not itself
    /// compare the info-fingerprint against ours; callers close the
    /// connection on mismatch via `validate`.
    pub async fn read<R: AsyncReadExt + Unpin>(reader: &mut R) -> PeerResult<Self> {
        let mut protocol_len_buf = [0u8; 1];
        reader.read_exact(&mut protocol_len_buf).await?;
        let mut rest = [0u8; 67];
        reader.read_exact(&mut rest).await?;
        Self::deserialize(&rest, protocol_len_buf[0])
    }

    /// Closes the connection (by returning an error) if the peer's
    /// info-fingerprint does not match ours.
    pub fn validate(&self, expected: [u8; 20]) -> PeerResult<()> {
        if self.info_fingerprint != expected {
            return Err(PeerError::InfoFingerprintMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_over_an_in_memory_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let fingerprint = [7u8; 20];
        let peer_id = [9u8; 20];
        let sent = Handshake::new(fingerprint, peer_id);
        sent.write(&mut client).await.unwrap();
        let received = Handshake::read(&mut server).await.unwrap();
        assert_eq!(received.info_fingerprint, fingerprint);
        assert_eq!(received.peer_id, peer_id);
        assert!(received.supports_extension_protocol());
        assert!(received.supports_dht());
        assert!(!received.supports_fast_extension());
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_length() {
        let (mut client, mut server) = tokio::io::duplex(128);
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[0] = 18;
        client.write_all(&bytes).await.unwrap();
        let err = Handshake::read(&mut server).await.unwrap_err();
        assert!(matches!(err, PeerError::InvalidProtocolLength(18)));
    }

    #[test]
    fn validate_rejects_fingerprint_mismatch() {
        let handshake = Handshake::new([1u8; 20], [0u8; 20]);
        assert!(handshake.validate([2u8; 20]).is_err());
        assert!(handshake.validate([1u8; 20]).is_ok());
    }
}
