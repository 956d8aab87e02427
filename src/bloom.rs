//! BEP33 scrape Bloom filters.
//!
//! A node answering a `get_peers` with `scrape=1` summarizes the seeders (`BFsd`) and the
//! leechers (`BFpe`) it knows about as two 2048-bit Bloom filters. Filters from many nodes are
//! OR-ed together and the number of distinct peers is estimated from the number of zero bits.
//!
//! https://www.bittorrent.org/beps/bep_0033.html

use crate::id::ShaHash;
use std::{convert::TryFrom, fmt, net::IpAddr, ops::BitOrAssign};
use thiserror::Error;

/// Length of a BEP33 filter in bytes.
pub const BLOOM_FILTER_LEN: usize = 256;

/// Length of a BEP33 filter in bits.
pub const BLOOM_FILTER_BITS: usize = BLOOM_FILTER_LEN * 8;

/// Estimate reported for a saturated filter.
pub const MAX_ESTIMATE: u32 = 6000;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid bloom filter length {0}, expected 256")]
pub struct BloomLengthError(pub usize);

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BloomFilter([u8; BLOOM_FILTER_LEN]);

impl BloomFilter {
    pub fn new() -> Self {
        Self([0; BLOOM_FILTER_LEN])
    }

    /// Insert the address of a peer.
    pub fn insert_ip(&mut self, ip: IpAddr) {
        let hash = match ip {
            IpAddr::V4(ip) => ShaHash::sha1(&ip.octets()),
            IpAddr::V6(ip) => ShaHash::sha1(&ip.octets()),
        };
        let hash = hash.as_ref();

        let index1 = (hash[0] as usize | (hash[1] as usize) << 8) % BLOOM_FILTER_BITS;
        let index2 = (hash[2] as usize | (hash[3] as usize) << 8) % BLOOM_FILTER_BITS;

        self.set_bit(index1);
        self.set_bit(index2);
    }

    /// OR the other filter into this one. Bits are never cleared.
    pub fn merge(&mut self, other: &BloomFilter) {
        for (dst, src) in self.0.iter_mut().zip(other.0.iter()) {
            *dst |= *src;
        }
    }

    /// Is every bit set in `other` also set in `self`?
    pub fn contains_all(&self, other: &BloomFilter) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(mine, theirs)| mine & theirs == *theirs)
    }

    pub fn count_zeros(&self) -> u32 {
        self.0.iter().map(|byte| byte.count_zeros()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    /// Estimated number of distinct peers inserted into the filter.
    ///
    /// `round(ln(c / m) / (2 * ln(1 - 1 / m)))` with `m = 2048` and `c` the number of zero bits
    /// capped at `m - 1`. An empty filter is exactly zero, a saturated one is `MAX_ESTIMATE`.
    pub fn estimate_count(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }

        let m = BLOOM_FILTER_BITS as f64;
        let c = self.count_zeros().min(BLOOM_FILTER_BITS as u32 - 1);

        if c == 0 {
            return MAX_ESTIMATE;
        }

        let estimate = (c as f64 / m).ln() / (2.0 * (1.0 - 1.0 / m).ln());

        estimate.round().min(MAX_ESTIMATE as f64) as u32
    }

    fn set_bit(&mut self, index: usize) {
        self.0[index / 8] |= 1 << (index % 8);
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitOrAssign<&BloomFilter> for BloomFilter {
    fn bitor_assign(&mut self, rhs: &BloomFilter) {
        self.merge(rhs)
    }
}

impl AsRef<[u8]> for BloomFilter {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; BLOOM_FILTER_LEN]> for BloomFilter {
    fn from(bytes: [u8; BLOOM_FILTER_LEN]) -> Self {
        Self(bytes)
    }
}

impl<'a> TryFrom<&'a [u8]> for BloomFilter {
    type Error = BloomLengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        let bytes = <[u8; BLOOM_FILTER_LEN]>::try_from(slice)
            .map_err(|_| BloomLengthError(slice.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "BloomFilter({} of {} bits set)",
            BLOOM_FILTER_BITS as u32 - self.count_zeros(),
            BLOOM_FILTER_BITS
        )
    }
}
