//! 160-bit node identifiers and XOR distance.
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 20];
        rand::rng().fill(&mut bytes);
        Self(bytes)
    }

    /// XOR distance to another id, itself a 160-bit value treated as an
    /// unsigned big-endian integer for comparison purposes.
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut out = [0u8; 20];
        for i in 0..20 {
            out[i] = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bit position (0..160) of the highest set bit of `self XOR other`,
    /// i.e. the k-bucket index a foreign id falls into. Returns `None` when
    /// the ids are equal (no bucket, the id is ours).
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let distance = self.distance(other);
        for (byte_index, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                let bit_in_byte = byte.leading_zeros() as usize;
                return Some(159 - (byte_index * 8 + bit_in_byte));
            }
        }
        None
    }

    /// Generates an id guaranteed to fall in bucket `index`'s range
    /// relative to `self`, for bucket-refresh `find_node` queries.
    pub fn random_in_bucket(&self, index: usize) -> NodeId {
        let mut id = self.0;
        let byte_index = (159 - index) / 8;
        let bit_in_byte = (159 - index) % 8;
        let mask = 0x80u8 >> bit_in_byte;
        // Flip the bit that defines this bucket, then randomize everything
        // below it so the result's distance has its highest set bit exactly
        // at `index`.
        id[byte_index] ^= mask;
        use rand::Rng;
        let mut rng = rand::rng();
        for b in id.iter_mut().skip(byte_index + 1) {
            *b = rng.random();
        }
        if bit_in_byte + 1 < 8 {
            let low_mask = 0xffu8 >> (bit_in_byte + 1);
            id[byte_index] = (id[byte_index] & !low_mask) | (rng.random::<u8>() & low_mask);
        }
        NodeId(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId::random();
        assert_eq!(id.distance(&id), [0u8; 20]);
    }

    #[test]
    fn bucket_index_of_self_is_none() {
        let id = NodeId::random();
        assert_eq!(id.bucket_index(&id), None);
    }

    #[test]
    fn bucket_index_finds_highest_set_bit() {
        let mut a = [0u8; 20];
        let mut b = [0u8; 20];
        a[0] = 0b0000_0001; // bit 159 (MSB of first byte is bit 159)
        b[0] = 0b0000_0000;
        let id_a = NodeId(a);
        let id_b = NodeId(b);
        // a XOR b has only bit 159-7=152 set (the last bit of byte 0).
        assert_eq!(id_a.bucket_index(&id_b), Some(152));
    }

    #[test]
    fn random_in_bucket_lands_in_the_requested_bucket() {
        let id = NodeId::random();
        for index in [0usize, 50, 100, 159] {
            let candidate = id.random_in_bucket(index);
            assert_eq!(id.bucket_index(&candidate), Some(index));
        }
    }
}
