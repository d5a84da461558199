//! Framed post-handshake messages: `<4-byte length><1-byte id><payload>`,
//! with length 0 meaning keep-alive.
use super::{PeerError, PeerResult, MAX_FRAME_LEN};
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bits: Vec<u8> },
    Request { piece_index: u32, offset: u32, length: u32 },
    Piece { piece_index: u32, offset: u32, data: Vec<u8> },
    Cancel { piece_index: u32, offset: u32, length: u32 },
    Port { port: u16 },
    SuggestPiece { piece_index: u32 },
    HaveAll,
    HaveNone,
    RejectRequest { piece_index: u32, offset: u32, length: u32 },
    AllowedFast { piece_index: u32 },
    Extended { ext_id: u8, payload: Vec<u8> },
}

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;
const ID_SUGGEST_PIECE: u8 = 13;
const ID_HAVE_ALL: u8 = 14;
const ID_HAVE_NONE: u8 = 15;
const ID_REJECT_REQUEST: u8 = 16;
const ID_ALLOWED_FAST: u8 = 17;
const ID_EXTENDED: u8 = 20;

impl Message {
    fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(ID_CHOKE),
            Message::Unchoke => Some(ID_UNCHOKE),
            Message::Interested => Some(ID_INTERESTED),
            Message::NotInterested => Some(ID_NOT_INTERESTED),
            Message::Have { .. } => Some(ID_HAVE),
            Message::Bitfield { .. } => Some(ID_BITFIELD),
            Message::Request { .. } => Some(ID_REQUEST),
            Message::Piece { .. } => Some(ID_PIECE),
            Message::Cancel { .. } => Some(ID_CANCEL),
            Message::Port { .. } => Some(ID_PORT),
            Message::SuggestPiece { .. } => Some(ID_SUGGEST_PIECE),
            Message::HaveAll => Some(ID_HAVE_ALL),
            Message::HaveNone => Some(ID_HAVE_NONE),
            Message::RejectRequest { .. } => Some(ID_REJECT_REQUEST),
            Message::AllowedFast { .. } => Some(ID_ALLOWED_FAST),
            Message::Extended { .. } => Some(ID_EXTENDED),
        }
    }

    /// Serializes this message into a length-prefixed frame ready to write
    /// to the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have { piece_index }
            | Message::SuggestPiece { piece_index }
            | Message::AllowedFast { piece_index } => {
                write_u32(&mut payload, *piece_index);
            }
            Message::Bitfield { bits } => payload.extend_from_slice(bits),
            Message::Request { piece_index, offset, length }
            | Message::Cancel { piece_index, offset, length }
            | Message::RejectRequest { piece_index, offset, length } => {
                write_u32(&mut payload, *piece_index);
                write_u32(&mut payload, *offset);
                write_u32(&mut payload, *length);
            }
            Message::Piece { piece_index, offset, data } => {
                write_u32(&mut payload, *piece_index);
                write_u32(&mut payload, *offset);
                payload.extend_from_slice(data);
            }
            Message::Port { port } => {
                let mut buf = [0u8; 2];
                BigEndian::write_u16(&mut buf, *port);
                payload.extend_from_slice(&buf);
            }
            Message::Extended { ext_id, payload: ext_payload } => {
                payload.push(*ext_id);
                payload.extend_from_slice(ext_payload);
            }
        }

        let id = self.id();
        let frame_len = id.map_or(0, |_| 1 + payload.len());
        let mut frame = Vec::with_capacity(4 + frame_len);
        write_u32(&mut frame, frame_len as u32);
        if let Some(id) = id {
            frame.push(id);
            frame.extend_from_slice(&payload);
        }
        frame
    }

    /// Writes this message's frame to an async stream.
    pub async fn write<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> PeerResult<()> {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Reads one framed message from an async stream.
    pub async fn read<R: AsyncReadExt + Unpin>(reader: &mut R) -> PeerResult<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = BigEndian::read_u32(&len_buf);
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(len));
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;
        Self::parse(&body)
    }

    fn parse(body: &[u8]) -> PeerResult<Self> {
        let id = body[0];
        let rest = &body[1..];
        match id {
            ID_CHOKE => Ok(Message::Choke),
            ID_UNCHOKE => Ok(Message::Unchoke),
            ID_INTERESTED => Ok(Message::Interested),
            ID_NOT_INTERESTED => Ok(Message::NotInterested),
            ID_HAVE_ALL => Ok(Message::HaveAll),
            ID_HAVE_NONE => Ok(Message::HaveNone),
            ID_HAVE => {
                let piece_index = read_u32(rest, id)?;
                Ok(Message::Have { piece_index })
            }
            ID_SUGGEST_PIECE => Ok(Message::SuggestPiece { piece_index: read_u32(rest, id)? }),
            ID_ALLOWED_FAST => Ok(Message::AllowedFast { piece_index: read_u32(rest, id)? }),
            ID_BITFIELD => Ok(Message::Bitfield { bits: rest.to_vec() }),
            ID_REQUEST | ID_CANCEL | ID_REJECT_REQUEST => {
                if rest.len() != 12 {
                    return Err(PeerError::MalformedPayload(id));
                }
                let piece_index = BigEndian::read_u32(&rest[0..4]);
                let offset = BigEndian::read_u32(&rest[4..8]);
                let length = BigEndian::read_u32(&rest[8..12]);
                Ok(match id {
                    ID_REQUEST => Message::Request { piece_index, offset, length },
                    ID_CANCEL => Message::Cancel { piece_index, offset, length },
                    _ => Message::RejectRequest { piece_index, offset, length },
                })
            }
            ID_PIECE => {
                if rest.len() < 8 {
                    return Err(PeerError::MalformedPayload(id));
                }
                let piece_index = BigEndian::read_u32(&rest[0..4]);
                let offset = BigEndian::read_u32(&rest[4..8]);
                let data = rest[8..].to_vec();
                Ok(Message::Piece { piece_index, offset, data })
            }
            ID_PORT => {
                if rest.len() != 2 {
                    return Err(PeerError::MalformedPayload(id));
                }
                Ok(Message::Port { port: BigEndian::read_u16(rest) })
            }
            ID_EXTENDED => {
                if rest.is_empty() {
                    return Err(PeerError::MalformedPayload(id));
                }
                Ok(Message::Extended { ext_id: rest[0], payload: rest[1..].to_vec() })
            }
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    let mut tmp = [0u8; 4];
    BigEndian::write_u32(&mut tmp, value);
    buf.extend_from_slice(&tmp);
}

fn read_u32(rest: &[u8], id: u8) -> PeerResult<u32> {
    if rest.len() != 4 {
        return Err(PeerError::MalformedPayload(id));
    }
    Ok(BigEndian::read_u32(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let encoded = msg.encode();
        // Strip the 4-byte length prefix the same way `read` would.
        let len = BigEndian::read_u32(&encoded[0..4]) as usize;
        let decoded = if len == 0 {
            Message::KeepAlive
        } else {
            Message::parse(&encoded[4..4 + len]).unwrap()
        };
        assert_eq!(decoded, msg);
    }

    #[test]
    fn keep_alive_is_a_zero_length_frame() {
        assert_eq!(Message::KeepAlive.encode(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn round_trips_all_fixed_shape_messages() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have { piece_index: 7 });
        round_trip(Message::Bitfield { bits: vec![0xff, 0x00] });
        round_trip(Message::Request { piece_index: 1, offset: 16384, length: 16384 });
        round_trip(Message::Piece { piece_index: 1, offset: 0, data: vec![1, 2, 3] });
        round_trip(Message::Cancel { piece_index: 1, offset: 0, length: 16384 });
        round_trip(Message::Port { port: 6881 });
        round_trip(Message::HaveAll);
        round_trip(Message::HaveNone);
        round_trip(Message::RejectRequest { piece_index: 2, offset: 0, length: 16384 });
        round_trip(Message::AllowedFast { piece_index: 3 });
        round_trip(Message::Extended { ext_id: 0, payload: b"d1:ve4:1.0e".to_vec() });
    }

    #[test]
    fn rejects_oversized_frame_length() {
        let mut bogus = Vec::new();
        write_u32(&mut bogus, MAX_FRAME_LEN + 1);
        // Only the length prefix matters for this check; `read` bails before
        // touching the body.
        let len = BigEndian::read_u32(&bogus);
        assert!(len > MAX_FRAME_LEN);
    }

    #[test]
    fn rejects_malformed_request_payload() {
        assert!(Message::parse(&[ID_REQUEST, 0, 0]).is_err());
    }

    #[test]
    fn rejects_unknown_message_id() {
        assert!(matches!(Message::parse(&[99]), Err(PeerError::UnknownMessageId(99))));
    }
}
