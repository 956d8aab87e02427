use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{
    convert::{TryFrom, TryInto},
    fmt,
    ops::BitXor,
};
use thiserror::Error;

/// Length of a SHA-1 hash.
pub const SHA_HASH_LEN: usize = 20;

/// Number of bits in an id.
pub const ID_BITS: usize = SHA_HASH_LEN * 8;

/// One bucket per possible log-distance plus one for the local node itself.
pub const NUM_BUCKETS: usize = ID_BITS + 1;

/// SHA-1 hash wrapper type for performing operations on the hash.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ShaHash(#[serde(with = "byte_array")] [u8; SHA_HASH_LEN]);

impl ShaHash {
    /// Create a ShaHash by hashing the given bytes using SHA-1.
    pub fn sha1(bytes: &[u8]) -> Self {
        let hash = Sha1::digest(bytes);
        Self(hash.into())
    }

    /// Flip the bit at the given index, where index 0 is the most significant bit.
    ///
    /// # Panics
    ///
    /// Panics if index is out of bounds (>= 160)
    pub fn flip_bit(self, index: usize) -> Self {
        let mut bytes = self.0;
        let (byte_index, bit_index) = (index / 8, index % 8);

        let actual_bit_index = 7 - bit_index;
        bytes[byte_index] ^= 1 << actual_bit_index;

        bytes.into()
    }

    fn bit(&self, index: usize) -> bool {
        let (byte_index, bit_index) = (index / 8, index % 8);
        self.0[byte_index] & (1 << (7 - bit_index)) != 0
    }

    /// Number of leading zero bits.
    pub fn leading_zeros(&self) -> u32 {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros();

            if byte != 0 {
                break;
            }
        }

        bits
    }

    /// Index of the most significant bit in which `self` and `other` differ, counted from the
    /// least significant end (so in `[0, 159]`), or `-1` if they are equal.
    pub fn log_distance(&self, other: &ShaHash) -> i16 {
        let zeros = (*self ^ *other).leading_zeros() as i16;
        ID_BITS as i16 - 1 - zeros
    }
}

/// Log-distance between two ids. See [`ShaHash::log_distance`].
pub fn log_distance(a: &ShaHash, b: &ShaHash) -> i16 {
    a.log_distance(b)
}

/// Generate a random id whose log-distance to `base` is exactly `log_dist`: the bit at
/// `log_dist` is flipped, every bit above it is copied from `base` and every bit below it is
/// random. A negative `log_dist` returns `base` unchanged.
///
/// # Panics
///
/// Panics if `log_dist` >= 160.
pub fn generate_close_id(base: ShaHash, log_dist: i16) -> ShaHash {
    generate_close_id_from(base, log_dist, rand::random())
}

fn generate_close_id_from(base: ShaHash, log_dist: i16, noise: ShaHash) -> ShaHash {
    if log_dist < 0 {
        return base;
    }

    assert!((log_dist as usize) < ID_BITS, "log-distance out of range");

    let flip_index = ID_BITS - 1 - log_dist as usize;
    let mut id = base.flip_bit(flip_index);

    for index in (flip_index + 1)..ID_BITS {
        if id.bit(index) != noise.bit(index) {
            id = id.flip_bit(index);
        }
    }

    id
}

impl AsRef<[u8]> for ShaHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<ShaHash> for [u8; SHA_HASH_LEN] {
    fn from(hash: ShaHash) -> [u8; SHA_HASH_LEN] {
        hash.0
    }
}

impl From<[u8; SHA_HASH_LEN]> for ShaHash {
    fn from(hash: [u8; SHA_HASH_LEN]) -> ShaHash {
        Self(hash)
    }
}

#[derive(Debug, Error)]
#[error("invalid SHA-1 hash length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for ShaHash {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl BitXor for ShaHash {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (src, dst) in rhs.0.iter().zip(self.0.iter_mut()) {
            *dst ^= *src;
        }

        self
    }
}

impl Distribution<ShaHash> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ShaHash {
        ShaHash(rng.gen())
    }
}

impl fmt::LowerHex for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for ShaHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

mod byte_array {
    use super::SHA_HASH_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::convert::TryInto;

    pub(super) fn serialize<S: Serializer>(
        bytes: &[u8; SHA_HASH_LEN],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; SHA_HASH_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?;
        let buf = buf.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", SHA_HASH_LEN);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}

// ----------------------------------------------------------------------------//

/// Bittorrent `NodeId`.
pub type NodeId = ShaHash;

/// Bittorrent `InfoHash`. Treated as a `NodeId` for distance purposes.
pub type InfoHash = ShaHash;

/// Length of a `NodeId`.
pub const NODE_ID_LEN: usize = SHA_HASH_LEN;

/// Length of an `InfoHash`.
pub const INFO_HASH_LEN: usize = SHA_HASH_LEN;

// ----------------------------------------------------------------------------//
