//! Piece-have bitmap, shared by the piece manager and the wire BITFIELD/HAVE
//! messages. Bit `i` (MSB-first within each byte, matching the wire format)
//! is set when piece `i` is held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// Creates an all-zero bitfield sized for `num_pieces` pieces.
    pub fn new(num_pieces: usize) -> Self {
        let len = num_pieces.div_ceil(8);
        Self {
            bytes: vec![0u8; len],
            num_pieces,
        }
    }

    /// Reconstructs a bitfield from the raw packed bytes of a BITFIELD
    /// message. Trailing spare bits beyond `num_pieces` are ignored but
    /// preserved verbatim (some clients set them; we neither read nor clear
    /// them).
    pub fn from_wire_bytes(bytes: &[u8], num_pieces: usize) -> Self {
        let mut buf = bytes.to_vec();
        let expected_len = num_pieces.div_ceil(8);
        buf.resize(expected_len, 0);
        Self {
            bytes: buf,
            num_pieces,
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte = self.bytes[index / 8];
        byte & (0x80 >> (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        self.bytes[index / 8] |= 0x80 >> (index % 8);
    }

    pub fn count_have(&self) -> usize {
        (0..self.num_pieces).filter(|&i| self.has(i)).count()
    }

    pub fn is_complete(&self) -> bool {
        self.count_have() == self.num_pieces
    }

    /// Indices of pieces this bitfield has that `other` lacks.
    pub fn missing_from(&self, other: &Bitfield) -> Vec<usize> {
        (0..self.num_pieces)
            .filter(|&i| self.has(i) && !other.has(i))
            .collect()
    }

    pub fn as_wire_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_query_round_trips() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.has(3));
        bf.set(3);
        assert!(bf.has(3));
        assert_eq!(bf.count_have(), 1);
    }

    #[test]
    fn partial_last_byte_is_padded_with_zero_bits() {
        let bf = Bitfield::new(9);
        assert_eq!(bf.as_wire_bytes().len(), 2);
        assert!(!bf.has(8));
    }

    #[test]
    fn from_wire_bytes_reconstructs_have_state() {
        // Piece 0 and piece 7 set: 0b1000_0001
        let bf = Bitfield::from_wire_bytes(&[0b1000_0001], 8);
        assert!(bf.has(0));
        assert!(bf.has(7));
        assert!(!bf.has(3));
    }

    #[test]
    fn is_complete_true_only_when_all_pieces_present() {
        let mut bf = Bitfield::new(2);
        assert!(!bf.is_complete());
        bf.set(0);
        bf.set(1);
        assert!(bf.is_complete());
    }

    #[test]
    fn missing_from_lists_indices_we_have_that_peer_lacks() {
        let mut ours = Bitfield::new(4);
        ours.set(0);
        ours.set(2);
        let theirs = Bitfield::new(4);
        assert_eq!(ours.missing_from(&theirs), vec![0, 2]);
    }
}
