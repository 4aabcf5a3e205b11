//! Hash-space identifiers and the XOR metric

use crate::error::{ProtocolError, Result};
use blake2::{Blake2b512, Digest};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a node ID in bytes (32 bytes / 256 bits)
pub const NODE_ID_SIZE: usize = 32;

/// Number of bits in a node ID
pub const NODE_ID_BITS: usize = NODE_ID_SIZE * 8;

/// A fixed-length identifier in the Kademlia hash space
///
/// Ordering is raw byte comparison. Equality of identifiers is the only
/// notion of node identity used by the routing layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// The all-zero identifier
    pub const ZERO: NodeId = NodeId([0u8; NODE_ID_SIZE]);

    /// Create a NodeId from a byte array
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    /// Create a NodeId from a slice, rejecting any length other than 32
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NODE_ID_SIZE] =
            bytes.try_into().map_err(|_| ProtocolError::InvalidNodeIdLength {
                expected: NODE_ID_SIZE,
                actual: bytes.len(),
            })?;
        Ok(NodeId(arr))
    }

    /// Get the bytes of this NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidHex(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Derive an identifier from arbitrary key material (BLAKE2b, truncated)
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(data);
        let digest = hasher.finalize();

        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&digest[..NODE_ID_SIZE]);
        NodeId(id)
    }

    /// Uniformly random identifier
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; NODE_ID_SIZE];
        rng.fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Random identifier whose first `depth` bits equal those of `prefix`
    ///
    /// This is the refresh target for the trie leaf at (`prefix`, `depth`).
    pub fn random_with_prefix<R: Rng + ?Sized>(prefix: &NodeId, depth: usize, rng: &mut R) -> Self {
        let depth = depth.min(NODE_ID_BITS);
        let mut id = Self::random(rng);

        let full_bytes = depth / 8;
        id.0[..full_bytes].copy_from_slice(&prefix.0[..full_bytes]);

        let rem = depth % 8;
        if rem > 0 {
            let mask = 0xFFu8 << (8 - rem);
            id.0[full_bytes] = (prefix.0[full_bytes] & mask) | (id.0[full_bytes] & !mask);
        }

        id
    }

    /// Random identifier at exactly log-distance `distance` from `self`
    pub fn random_at_distance<R: Rng + ?Sized>(&self, distance: usize, rng: &mut R) -> Self {
        if distance == 0 {
            return *self;
        }
        let distance = distance.min(NODE_ID_BITS);

        // Shared prefix of (bits - distance), then the differing bit.
        let shared = NODE_ID_BITS - distance;
        Self::random_with_prefix(self, shared, rng).with_bit(shared, !self.bit(shared))
    }

    /// Calculate XOR distance between two node IDs
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut result = [0u8; NODE_ID_SIZE];
        for (i, item) in result.iter_mut().enumerate() {
            *item = self.0[i] ^ other.0[i];
        }
        Distance(result)
    }

    /// Log-distance: bit length minus the index of the highest differing bit
    ///
    /// 0 for identical ids, 256 when the most significant bit differs.
    pub fn log_distance(&self, other: &NodeId) -> usize {
        NODE_ID_BITS - self.common_prefix_len(other)
    }

    /// Number of leading bits shared with `other`
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Bit at `index`, most significant bit first
    pub fn bit(&self, index: usize) -> bool {
        assert!(index < NODE_ID_BITS, "bit index {} out of range", index);
        (self.0[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Copy of `self` with the bit at `index` set to `value`
    pub fn with_bit(mut self, index: usize, value: bool) -> Self {
        assert!(index < NODE_ID_BITS, "bit index {} out of range", index);
        let mask = 1u8 << (7 - index % 8);
        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
        self
    }

    /// Whether the first `depth` bits of `self` equal those of `prefix`
    pub fn has_prefix(&self, prefix: &NodeId, depth: usize) -> bool {
        self.common_prefix_len(prefix) >= depth
    }
}

impl From<[u8; NODE_ID_SIZE]> for NodeId {
    fn from(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// XOR distance between two identifiers
///
/// Compares as a big-endian unsigned integer, so `a < b` means "closer".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; NODE_ID_SIZE]);

impl Distance {
    /// The distance of an identifier to itself
    pub const ZERO: Distance = Distance([0u8; NODE_ID_SIZE]);

    /// The largest possible distance
    pub const MAX: Distance = Distance([0xFF; NODE_ID_SIZE]);

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; NODE_ID_SIZE]
    }

    /// Count of leading zero bits (256 for a zero distance)
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        NODE_ID_BITS
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn test_node_id_hex() {
        let bytes = [42u8; NODE_ID_SIZE];
        let node_id = NodeId::from_bytes(bytes);

        let hex = node_id.to_hex();
        let parsed = NodeId::from_hex(&hex).unwrap();

        assert_eq!(node_id, parsed);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        let err = NodeId::from_slice(&[0u8; 31]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidNodeIdLength {
                expected: 32,
                actual: 31
            }
        );
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex("zz").is_err());
    }

    #[test]
    fn test_node_id_distance() {
        let id1 = NodeId::from_bytes([0xFF; NODE_ID_SIZE]);
        let id2 = NodeId::from_bytes([0x00; NODE_ID_SIZE]);

        let distance = id1.distance(&id2);
        assert_eq!(distance, Distance::MAX);

        let distance2 = id2.distance(&id1);
        assert_eq!(distance, distance2); // XOR is symmetric
    }

    #[test]
    fn test_distance_zero_iff_equal() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            let a = NodeId::random(&mut rng);
            let b = NodeId::random(&mut rng);
            assert!(a.distance(&a).is_zero());
            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.distance(&b).is_zero(), a == b);
        }
    }

    #[test]
    fn test_log_distance() {
        let zero = NodeId::ZERO;
        assert_eq!(zero.log_distance(&zero), 0);
        assert_eq!(zero.log_distance(&id_with_first_byte(0b1000_0000)), 256);
        assert_eq!(zero.log_distance(&id_with_first_byte(0b0100_0000)), 255);

        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes[31] = 1;
        assert_eq!(zero.log_distance(&NodeId::from_bytes(bytes)), 1);
    }

    #[test]
    fn test_bit_access() {
        let id = id_with_first_byte(0b1010_0000);
        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(!id.bit(255));
    }

    #[test]
    fn test_with_bit() {
        let id = NodeId::ZERO.with_bit(0, true).with_bit(9, true);
        assert_eq!(id.as_bytes()[0], 0b1000_0000);
        assert_eq!(id.as_bytes()[1], 0b0100_0000);
        assert_eq!(id.with_bit(0, false).as_bytes()[0], 0);
    }

    #[test]
    fn test_random_with_prefix_keeps_prefix() {
        let mut rng = StdRng::seed_from_u64(42);
        let prefix = NodeId::random(&mut rng);
        for depth in [0, 1, 7, 8, 13, 64, 255, 256] {
            let id = NodeId::random_with_prefix(&prefix, depth, &mut rng);
            assert!(id.has_prefix(&prefix, depth), "depth {}", depth);
        }
    }

    #[test]
    fn test_random_at_distance() {
        let mut rng = StdRng::seed_from_u64(3);
        let local = NodeId::random(&mut rng);
        for d in [0, 1, 2, 9, 128, 255, 256] {
            let id = local.random_at_distance(d, &mut rng);
            assert_eq!(local.log_distance(&id), d);
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(NodeId::hash(b"node-1"), NodeId::hash(b"node-1"));
        assert_ne!(NodeId::hash(b"node-1"), NodeId::hash(b"node-2"));
    }

    #[test]
    fn test_distance_ordering() {
        let target = NodeId::ZERO;
        let near = id_with_first_byte(0x01);
        let far = id_with_first_byte(0x80);
        assert!(target.distance(&near) < target.distance(&far));
    }
}
