//! Kademlia unique identifiers and the XOR metric.
//!
//! A [`Kuid`] is an immutable big-endian bit string. Node identities and
//! value keys share the same space, and the distance between two ids is their
//! bitwise XOR read as an unsigned integer. Every operation that combines two
//! ids checks that they have the same bit length.

use std::cmp::Ordering;
use std::fmt;

use rand::{Rng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DhtError, DhtResult};

/// Default identifier length in bytes (160 bits).
pub const DEFAULT_ID_BYTES: usize = 20;

/// Default identifier length in bits.
pub const DEFAULT_ID_BITS: usize = DEFAULT_ID_BYTES * 8;

/// A fixed-length identifier in the DHT key space.
///
/// Equality, hashing and `Ord` are plain byte comparisons. For ids of equal
/// length `Ord` is the unsigned big-endian order; use
/// [`compare_to`](Self::compare_to) when the lengths are not known to match.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kuid(Box<[u8]>);

impl Kuid {
    /// Build an identifier from raw big-endian bytes.
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// The all-zero identifier of `len` bytes.
    pub fn zero(len: usize) -> Self {
        Self(vec![0u8; len].into_boxed_slice())
    }

    /// The all-ones identifier of `len` bytes.
    pub fn max_value(len: usize) -> Self {
        Self(vec![0xffu8; len].into_boxed_slice())
    }

    /// A uniformly random identifier of `len` bytes.
    pub fn random(len: usize) -> Self {
        Self::random_with(&mut rand::thread_rng(), len)
    }

    pub fn random_with<R: RngCore + ?Sized>(rng: &mut R, len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rng.fill_bytes(&mut bytes);
        Self(bytes.into_boxed_slice())
    }

    /// A random identifier that keeps bits `0..=bit_depth` of `prefix`.
    ///
    /// Used to aim a lookup into a specific bucket. A `bit_depth` past the
    /// end of the id returns a copy of `prefix`.
    pub fn random_with_prefix(prefix: &Kuid, bit_depth: usize) -> Self {
        Self::random_with_prefix_rng(&mut rand::thread_rng(), prefix, bit_depth)
    }

    pub fn random_with_prefix_rng<R: Rng + ?Sized>(
        rng: &mut R,
        prefix: &Kuid,
        bit_depth: usize,
    ) -> Self {
        let keep = (bit_depth + 1).min(prefix.length());
        let random = Self::random_with(rng, prefix.0.len());
        let mut out = prefix.0.to_vec();
        for (idx, byte) in out.iter_mut().enumerate() {
            let first_bit = idx * 8;
            if first_bit >= keep {
                *byte = random.0[idx];
            } else if first_bit + 8 > keep {
                let kept_bits = keep - first_bit;
                let mask = 0xffu8 << (8 - kept_bits);
                *byte = (*byte & mask) | (random.0[idx] & !mask);
            }
        }
        Self(out.into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length of the identifier in bits.
    pub fn length(&self) -> usize {
        self.0.len() * 8
    }

    /// Fails unless `other` has the same bit length as `self`.
    pub fn check_length(&self, other: &Kuid) -> DhtResult<()> {
        if self.0.len() == other.0.len() {
            Ok(())
        } else {
            Err(DhtError::length_mismatch(self.length(), other.length()))
        }
    }

    /// XOR distance between `self` and `other`.
    pub fn xor(&self, other: &Kuid) -> DhtResult<Kuid> {
        self.check_length(other)?;
        Ok(self.xor_unchecked(other))
    }

    pub(crate) fn xor_unchecked(&self, other: &Kuid) -> Kuid {
        debug_assert_eq!(self.0.len(), other.0.len());
        let bytes: Vec<u8> = self.0.iter().zip(other.0.iter()).map(|(a, b)| a ^ b).collect();
        Self(bytes.into_boxed_slice())
    }

    /// Bitwise complement.
    pub fn negate(&self) -> Kuid {
        let bytes: Vec<u8> = self.0.iter().map(|b| !b).collect();
        Self(bytes.into_boxed_slice())
    }

    /// Unsigned big-endian comparison.
    pub fn compare_to(&self, other: &Kuid) -> DhtResult<Ordering> {
        self.check_length(other)?;
        Ok(self.0.cmp(&other.0))
    }

    /// Number of leading bits `self` and `other` have in common.
    pub fn common_prefix_length(&self, other: &Kuid) -> DhtResult<usize> {
        self.check_length(other)?;
        for (idx, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return Ok(idx * 8 + diff.leading_zeros() as usize);
            }
        }
        Ok(self.length())
    }

    /// Value of the bit at `index`, counting from the most significant bit.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.length()`.
    pub fn bit_at(&self, index: usize) -> bool {
        assert!(index < self.length(), "bit index {index} out of range");
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Copy of `self` with the bit at `index` set to `value`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.length()`.
    pub fn with_bit(&self, index: usize, value: bool) -> Kuid {
        assert!(index < self.length(), "bit index {index} out of range");
        let mut bytes = self.0.to_vec();
        let mask = 0x80u8 >> (index % 8);
        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }
        Self(bytes.into_boxed_slice())
    }

    /// Copy of `self` with the bit at `index` inverted.
    pub fn flip_bit(&self, index: usize) -> Kuid {
        let current = self.bit_at(index);
        self.with_bit(index, !current)
    }

    /// Copy of `self` keeping the first `bits` bits and zeroing the rest.
    pub(crate) fn masked(&self, bits: usize) -> Kuid {
        let mut bytes = self.0.to_vec();
        for (idx, byte) in bytes.iter_mut().enumerate() {
            let first_bit = idx * 8;
            if first_bit >= bits {
                *byte = 0;
            } else if first_bit + 8 > bits {
                *byte &= 0xffu8 << (8 - (bits - first_bit));
            }
        }
        Self(bytes.into_boxed_slice())
    }

    /// `true` if `self` is strictly closer to `target` than `other` is.
    pub fn is_closer_to(&self, target: &Kuid, other: &Kuid) -> DhtResult<bool> {
        self.check_length(target)?;
        other.check_length(target)?;
        Ok(distance_cmp(self, other, target) == Ordering::Less)
    }

    /// Short hex prefix for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }
}

/// Order `a` and `b` by XOR distance to `target`.
///
/// Callers must have validated that all three ids share one length.
pub(crate) fn distance_cmp(a: &Kuid, b: &Kuid, target: &Kuid) -> Ordering {
    for ((x, y), t) in a.0.iter().zip(b.0.iter()).zip(target.0.iter()) {
        match (x ^ t).cmp(&(y ^ t)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({})", hex::encode(&self.0))
    }
}

impl Serialize for Kuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Kuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded).map_err(serde::de::Error::custom)?;
        if bytes.is_empty() {
            return Err(serde::de::Error::custom("empty identifier"));
        }
        Ok(Kuid::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn id(bytes: &[u8]) -> Kuid {
        Kuid::from_bytes(bytes.to_vec())
    }

    #[test]
    fn xor_produces_expected_value() {
        let a = id(&[0b1010_1010, 0x00]);
        let b = id(&[0b0101_0101, 0x00]);
        let dist = a.xor(&b).unwrap();
        assert_eq!(dist.as_bytes(), &[0xff, 0x00]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let a = Kuid::zero(20);
        let b = Kuid::zero(32);
        assert!(matches!(
            a.xor(&b),
            Err(DhtError::LengthMismatch { expected: 160, actual: 256 })
        ));
        assert!(a.compare_to(&b).is_err());
        assert!(a.common_prefix_length(&b).is_err());
        assert!(a.is_closer_to(&b, &a).is_err());
    }

    #[test]
    fn common_prefix_length_finds_first_different_bit() {
        let zero = Kuid::zero(4);
        assert_eq!(zero.common_prefix_length(&zero).unwrap(), 32);
        assert_eq!(
            zero.common_prefix_length(&id(&[0x80, 0, 0, 0])).unwrap(),
            0
        );
        assert_eq!(
            zero.common_prefix_length(&id(&[0x00, 0x10, 0, 0])).unwrap(),
            11
        );
    }

    #[test]
    fn bit_manipulation_returns_new_values() {
        let zero = Kuid::zero(2);
        let set = zero.with_bit(9, true);
        assert!(!zero.bit_at(9));
        assert!(set.bit_at(9));
        assert_eq!(set.as_bytes(), &[0x00, 0x40]);
        assert_eq!(set.flip_bit(9), zero);
        assert_eq!(zero.negate(), Kuid::max_value(2));
    }

    #[test]
    #[should_panic]
    fn bit_at_out_of_range_panics() {
        Kuid::zero(1).bit_at(8);
    }

    #[test]
    fn masked_keeps_leading_bits() {
        let id = Kuid::max_value(2);
        assert_eq!(id.masked(0), Kuid::zero(2));
        assert_eq!(id.masked(3).as_bytes(), &[0b1110_0000, 0x00]);
        assert_eq!(id.masked(12).as_bytes(), &[0xff, 0xf0]);
        assert_eq!(id.masked(16), id);
    }

    #[test]
    fn random_with_prefix_keeps_depth_plus_one_bits() {
        let mut rng = StdRng::seed_from_u64(7);
        let prefix = Kuid::max_value(DEFAULT_ID_BYTES);
        for depth in [0usize, 3, 7, 8, 42, 158] {
            for _ in 0..16 {
                let random = Kuid::random_with_prefix_rng(&mut rng, &prefix, depth);
                assert!(random.common_prefix_length(&prefix).unwrap() >= depth + 1);
            }
        }

        let zero = Kuid::zero(DEFAULT_ID_BYTES);
        let ids: Vec<Kuid> = (0..32)
            .map(|_| Kuid::random_with_prefix_rng(&mut rng, &zero, 3))
            .collect();
        assert!(ids.iter().all(|id| id.masked(4) == zero));
        assert!(ids.iter().any(|id| id != &zero), "suffix should be random");
    }

    #[test]
    fn is_closer_to_uses_xor_metric() {
        let target = id(&[0x18]);
        let near = id(&[0x10]);
        let far = id(&[0x20]);
        assert!(near.is_closer_to(&target, &far).unwrap());
        assert!(!far.is_closer_to(&target, &near).unwrap());
        assert!(!near.is_closer_to(&target, &near).unwrap());
    }

    #[test]
    fn serde_uses_hex_strings() {
        let id = id(&[0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: Kuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<Kuid>("\"\"").is_err());
    }

    fn arb_pair() -> impl Strategy<Value = (Kuid, Kuid)> {
        (
            proptest::collection::vec(any::<u8>(), DEFAULT_ID_BYTES),
            proptest::collection::vec(any::<u8>(), DEFAULT_ID_BYTES),
        )
            .prop_map(|(a, b)| (Kuid::from_bytes(a), Kuid::from_bytes(b)))
    }

    proptest! {
        #[test]
        fn xor_is_symmetric((a, b) in arb_pair()) {
            prop_assert_eq!(a.xor(&b).unwrap(), b.xor(&a).unwrap());
        }

        #[test]
        fn xor_with_self_is_zero((a, _b) in arb_pair()) {
            prop_assert_eq!(a.xor(&a).unwrap(), Kuid::zero(DEFAULT_ID_BYTES));
        }

        #[test]
        fn xor_is_invertible((a, b) in arb_pair()) {
            prop_assert_eq!(a.xor(&b).unwrap().xor(&b).unwrap(), a);
        }

        #[test]
        fn closeness_matches_distance_order((a, b) in arb_pair(), t in proptest::collection::vec(any::<u8>(), DEFAULT_ID_BYTES)) {
            let target = Kuid::from_bytes(t);
            let da = a.xor(&target).unwrap();
            let db = b.xor(&target).unwrap();
            prop_assert_eq!(a.is_closer_to(&target, &b).unwrap(), da < db);
            if a != b {
                prop_assert!(a.is_closer_to(&target, &b).unwrap() ^ b.is_closer_to(&target, &a).unwrap());
            }
        }
    }
}
