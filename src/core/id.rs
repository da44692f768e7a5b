//! Protocol identifier types.

use std::{fmt, str::FromStr};

use rand::{thread_rng, Fill};
use thiserror::Error;

/// Errors produced when building an identifier from untrusted input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KuidError {
    #[error("identifier must be {expected} bytes long, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("identifier contains a non-hex character at position {0}")]
    InvalidHex(usize),
}

/// A 160-bit identifier that implements a non-euclidian XOR-based distance metric.
///
/// Bits are indexed from the most-significant end: bit `0` is the high bit of the first byte.
/// The derived ordering compares the raw bytes, which is the numeric (big-endian) order of the
/// identifier space; the routing trie relies on this to resolve prefixes with range queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Kuid {
    bytes: [u8; Self::BYTES],
}

impl Kuid {
    /// The size of the identifier in bytes.
    pub const BYTES: usize = 20;

    /// The size of the identifier in bits.
    pub const BITS: usize = Self::BYTES * 8;

    /// The all-zero identifier, the start of the identifier space.
    pub const MIN: Kuid = Kuid {
        bytes: [0u8; Self::BYTES],
    };

    /// The all-ones identifier, the end of the identifier space.
    pub const MAX: Kuid = Kuid {
        bytes: [0xff; Self::BYTES],
    };

    /// Creates a new identifier from the supplied bytes.
    pub const fn new(bytes: [u8; Self::BYTES]) -> Self {
        Kuid { bytes }
    }

    /// Creates an identifier from a slice, failing if it isn't exactly [`Kuid::BYTES`] long.
    pub fn from_slice(slice: &[u8]) -> Result<Self, KuidError> {
        let bytes: [u8; Self::BYTES] =
            slice.try_into().map_err(|_| KuidError::InvalidLength {
                expected: Self::BYTES,
                actual: slice.len(),
            })?;

        Ok(Self { bytes })
    }

    /// Returns the bytes backing the identifier.
    pub fn bytes(&self) -> [u8; Self::BYTES] {
        self.bytes
    }

    /// Generates a uniformly random identifier.
    pub fn random() -> Self {
        let mut rng = thread_rng();
        let mut bytes = [0u8; Self::BYTES];
        let _res = bytes.try_fill(&mut rng);
        // Sanity check this doesn't fail in debug mode.
        debug_assert!(_res.is_ok());

        Self { bytes }
    }

    /// Generates a random identifier that agrees with `prefix` on its first `depth` bits.
    ///
    /// Used to pick lookup targets that land in a given bucket when refreshing it.
    pub fn random_with_prefix(prefix: &Kuid, depth: usize) -> Self {
        let depth = depth.min(Self::BITS);
        let mut id = Self::random();

        let full_bytes = depth / 8;
        id.bytes[..full_bytes].copy_from_slice(&prefix.bytes[..full_bytes]);

        let rem = depth % 8;
        if rem != 0 {
            // High `rem` bits come from the prefix, the rest stay random.
            let mask = 0xffu8 << (8 - rem);
            id.bytes[full_bytes] = (prefix.bytes[full_bytes] & mask) | (id.bytes[full_bytes] & !mask);
        }

        id
    }

    /// Computes the XOR distance between two identifiers.
    pub fn xor(&self, other: &Kuid) -> Kuid {
        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }

        Kuid { bytes }
    }

    /// Returns the index of the most-significant bit at which the identifiers differ, `None` if
    /// they are equal.
    pub fn bit_index(&self, other: &Kuid) -> Option<u32> {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .map(|(&a, &b)| a ^ b)
            .enumerate()
            .find(|(_, byte)| byte != &0b0)
            // The left shift multiplies the index by 8 to get its value in bits.
            .map(|(i, byte)| byte.leading_zeros() + ((i as u32) << 3))
    }

    /// Returns `true` if the bit at `index` is set.
    ///
    /// # Panics
    ///
    /// Panics if `index >= Kuid::BITS`.
    pub fn is_bit_set(&self, index: usize) -> bool {
        self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Returns a copy of this identifier with the bit at `index` set.
    ///
    /// # Panics
    ///
    /// Panics if `index >= Kuid::BITS`.
    pub fn set_bit(&self, index: usize) -> Kuid {
        let mut bytes = self.bytes;
        bytes[index / 8] |= 0x80 >> (index % 8);

        Kuid { bytes }
    }

    /// Returns a copy of this identifier with the bit at `index` cleared.
    ///
    /// # Panics
    ///
    /// Panics if `index >= Kuid::BITS`.
    pub fn unset_bit(&self, index: usize) -> Kuid {
        let mut bytes = self.bytes;
        bytes[index / 8] &= !(0x80 >> (index % 8));

        Kuid { bytes }
    }

    /// Keeps the first `depth` bits and zeroes the rest.
    pub fn prefix(&self, depth: usize) -> Kuid {
        let depth = depth.min(Self::BITS);
        let mut bytes = [0u8; Self::BYTES];

        let full_bytes = depth / 8;
        bytes[..full_bytes].copy_from_slice(&self.bytes[..full_bytes]);

        let rem = depth % 8;
        if rem != 0 {
            bytes[full_bytes] = self.bytes[full_bytes] & (0xffu8 << (8 - rem));
        }

        Kuid { bytes }
    }

    /// Returns `true` if both identifiers share their first `depth` bits.
    pub fn shares_prefix(&self, other: &Kuid, depth: usize) -> bool {
        match self.bit_index(other) {
            Some(i) => i as usize >= depth,
            None => true,
        }
    }

    /// Returns `true` if `self` is strictly closer to `target` than `other` is.
    pub fn is_closer(&self, other: &Kuid, target: &Kuid) -> bool {
        self.xor(target) < other.xor(target)
    }
}

impl fmt::Display for Kuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl FromStr for Kuid {
    type Err = KuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::BYTES * 2 {
            return Err(KuidError::InvalidLength {
                expected: Self::BYTES,
                actual: s.len() / 2,
            });
        }

        let mut bytes = [0u8; Self::BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pos = i * 2;
            let pair = s.get(pos..pos + 2).ok_or(KuidError::InvalidHex(pos))?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| KuidError::InvalidHex(pos))?;
        }

        Ok(Kuid { bytes })
    }
}

impl From<[u8; Kuid::BYTES]> for Kuid {
    fn from(bytes: [u8; Kuid::BYTES]) -> Self {
        Self::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    // Builds an identifier whose two leading bytes hold `raw` (big-endian), the rest are zero.
    fn from_u16(raw: u16) -> Kuid {
        let mut bytes = [0u8; Kuid::BYTES];
        bytes[..2].copy_from_slice(&raw.to_be_bytes());

        Kuid::new(bytes)
    }

    #[test]
    fn bit_index() {
        const N: usize = 1000;

        let mut rng = thread_rng();

        for _ in 0..N {
            let a: u16 = rng.gen();
            let b: u16 = rng.gen();

            let id_a = from_u16(a);
            let id_b = from_u16(b);

            if a == b {
                assert_eq!(id_a.bit_index(&id_b), None);
                continue;
            }

            let xor = a ^ b;
            assert_eq!(id_a.bit_index(&id_b), Some(xor.leading_zeros()));
        }
    }

    #[test]
    fn bit_index_self() {
        let id = Kuid::random();
        assert_eq!(id.bit_index(&id), None);
        assert_eq!(id.xor(&id), Kuid::MIN);
    }

    #[test]
    fn bit_index_last_bit() {
        let a = Kuid::MIN;
        let b = a.set_bit(Kuid::BITS - 1);
        assert_eq!(a.bit_index(&b), Some(Kuid::BITS as u32 - 1));
    }

    #[test]
    fn set_and_unset_bits() {
        let id = Kuid::MIN.set_bit(0).set_bit(9);
        assert!(id.is_bit_set(0));
        assert!(!id.is_bit_set(1));
        assert!(id.is_bit_set(9));
        assert_eq!(id.bytes()[0], 0x80);
        assert_eq!(id.bytes()[1], 0x40);

        let id = id.unset_bit(0);
        assert!(!id.is_bit_set(0));
        assert_eq!(id.unset_bit(9), Kuid::MIN);
    }

    #[test]
    fn random_with_prefix_agrees_on_prefix() {
        const N: usize = 1000;

        let mut rng = thread_rng();

        for _ in 0..N {
            let prefix = Kuid::random();
            let depth = rng.gen_range(0..=Kuid::BITS);
            let id = Kuid::random_with_prefix(&prefix, depth);

            assert!(id.shares_prefix(&prefix, depth));
            assert_eq!(id.prefix(depth), prefix.prefix(depth));
        }
    }

    #[test]
    fn random_with_full_prefix_is_prefix() {
        let prefix = Kuid::random();
        assert_eq!(Kuid::random_with_prefix(&prefix, Kuid::BITS), prefix);
    }

    #[test]
    fn prefix_masks_trailing_bits() {
        let id = Kuid::MAX;
        let prefix = id.prefix(12);
        assert_eq!(prefix.bytes()[0], 0xff);
        assert_eq!(prefix.bytes()[1], 0xf0);
        assert!(prefix.bytes()[2..].iter().all(|b| *b == 0));
        assert_eq!(id.prefix(0), Kuid::MIN);
        assert_eq!(id.prefix(Kuid::BITS), Kuid::MAX);
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(from_u16(1) < from_u16(2));
        assert!(from_u16(0x00ff) < from_u16(0x0100));
        assert!(Kuid::MIN < Kuid::MAX);
    }

    #[test]
    fn is_closer() {
        let target = from_u16(0b0000_0000_0000_0100);
        let near = from_u16(0b0000_0000_0000_0101);
        let far = from_u16(0b1000_0000_0000_0000);

        assert!(near.is_closer(&far, &target));
        assert!(!far.is_closer(&near, &target));
        assert!(!near.is_closer(&near, &target));
    }

    #[test]
    fn from_slice_rejects_bad_lengths() {
        assert_eq!(
            Kuid::from_slice(&[]),
            Err(KuidError::InvalidLength {
                expected: 20,
                actual: 0
            })
        );
        assert!(Kuid::from_slice(&[0u8; 21]).is_err());
        assert_eq!(Kuid::from_slice(&[0u8; 20]), Ok(Kuid::MIN));
    }

    #[test]
    fn hex_display_and_parse() {
        let id = Kuid::random();
        let parsed: Kuid = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        assert!("zz".parse::<Kuid>().is_err());
        assert!("zz00000000000000000000000000000000000000"
            .parse::<Kuid>()
            .is_err());
    }
}
