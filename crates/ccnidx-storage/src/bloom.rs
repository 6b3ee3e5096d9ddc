//! Bloom filter over name components, in the ccnx wire layout.
//!
//! ```text
//! +---------+--------+--------+----------+----------+-------------+
//! | lg_bits | n_hash | method | reserved | seed[4]  | bits...     |
//! +---------+--------+--------+----------+----------+-------------+
//!     0         1        2         3        4..8      8..
//! ```
//!
//! `method` is always `'A'`. The bit array holds at most 1024 bytes. Bit `h`
//! lives in byte `h >> 3` under mask `1 << (h & 7)`.

use ccnidx_common::{CcnxError, Result};

/// Size of the fixed part of the wire form.
pub const BLOOM_HEADER_SIZE: usize = 8;

/// Largest bit array in bytes.
pub const MAX_BLOOM_BYTES: usize = 1024;

/// Largest `lg_bits` the bit array can address.
pub const MAX_LG_BITS: u8 = 13;

/// The only hashing method defined.
pub const METHOD_A: u8 = b'A';

const MAX_HASHES: u8 = 32;

/// One step of the 31-bit shift-register hash.
#[inline]
fn nexthash(s: u32, u: u32) -> u32 {
    const K: u32 = 13;
    let b = s & ((1 << K) - 1);
    let s = ((s >> K) ^ (b << (31 - K)) ^ (b << (31 - 2 * K))) & 0x7FFF_FFFF;
    s ^ u
}

#[inline]
fn seed_state(seed: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*seed) & 0x7FFF_FFFF
}

/// Runs the hash over `data`, returning the state from which the bit
/// positions are drawn.
fn absorb(seed: &[u8; 4], data: &[u8]) -> u32 {
    data.iter()
        .fold(seed_state(seed), |s, b| nexthash(s, *b as u32 + 1))
}

fn bit_positions(
    seed: &[u8; 4],
    lg_bits: u8,
    n_hash: u8,
    nbytes: usize,
    data: &[u8],
) -> impl Iterator<Item = usize> {
    let mask = ((8 * nbytes - 1) as u32) & ((1u32 << lg_bits) - 1);
    let mut s = absorb(seed, data);
    (0..n_hash).map(move |_| {
        s = nexthash(s, 0);
        (s & mask) as usize
    })
}

/// An owned Bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    lg_bits: u8,
    n_hash: u8,
    seed: [u8; 4],
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Creates an empty filter with `2^lg_bits` bits.
    pub fn new(lg_bits: u8, n_hash: u8, seed: [u8; 4]) -> Result<Self> {
        if !(3..=MAX_LG_BITS).contains(&lg_bits) {
            return Err(CcnxError::InvalidDescriptor(format!(
                "bloom lg_bits {} outside 3..={}",
                lg_bits, MAX_LG_BITS
            )));
        }
        if n_hash == 0 || n_hash > MAX_HASHES {
            return Err(CcnxError::InvalidDescriptor(format!(
                "bloom hash count {} outside 1..={}",
                n_hash, MAX_HASHES
            )));
        }
        Ok(Self {
            lg_bits,
            n_hash,
            seed,
            bits: vec![0; (1usize << lg_bits) / 8],
        })
    }

    /// Creates a filter sized for about `members` insertions.
    pub fn with_capacity(members: usize, seed: [u8; 4]) -> Self {
        let mut lg_bits = 3u8;
        while lg_bits < MAX_LG_BITS && (1usize << lg_bits) < members.saturating_mul(9) {
            lg_bits += 1;
        }
        let per_member = (1usize << lg_bits) / members.max(1);
        let n_hash = ((per_member as f64 * std::f64::consts::LN_2).round() as u8).clamp(1, 8);
        Self {
            lg_bits,
            n_hash,
            seed,
            bits: vec![0; (1usize << lg_bits) / 8],
        }
    }

    /// Adds a component to the filter.
    pub fn insert(&mut self, data: &[u8]) {
        let positions: Vec<usize> =
            bit_positions(&self.seed, self.lg_bits, self.n_hash, self.bits.len(), data).collect();
        for h in positions {
            self.bits[h >> 3] |= 1 << (h & 7);
        }
    }

    /// Returns true if the component may be in the filter.
    pub fn matches(&self, data: &[u8]) -> bool {
        bit_positions(&self.seed, self.lg_bits, self.n_hash, self.bits.len(), data)
            .all(|h| self.bits[h >> 3] & (1 << (h & 7)) != 0)
    }

    /// Wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(BLOOM_HEADER_SIZE + self.bits.len());
        buf.push(self.lg_bits);
        buf.push(self.n_hash);
        buf.push(METHOD_A);
        buf.push(0);
        buf.extend_from_slice(&self.seed);
        buf.extend_from_slice(&self.bits);
        buf
    }

    /// Parses and copies the wire form.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let view = BloomRef::parse(buf)?;
        Ok(Self {
            lg_bits: view.lg_bits,
            n_hash: view.n_hash,
            seed: view.seed,
            bits: view.bits.to_vec(),
        })
    }
}

/// A Bloom filter borrowed from wire bytes.
#[derive(Debug, Clone, Copy)]
pub struct BloomRef<'a> {
    lg_bits: u8,
    n_hash: u8,
    seed: [u8; 4],
    bits: &'a [u8],
}

impl<'a> BloomRef<'a> {
    /// Validates the wire form without copying.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() <= BLOOM_HEADER_SIZE {
            return Err(CcnxError::InvalidDescriptor(format!(
                "bloom filter of {} bytes is too short",
                buf.len()
            )));
        }
        let (lg_bits, n_hash, method) = (buf[0], buf[1], buf[2]);
        if method != METHOD_A {
            return Err(CcnxError::InvalidDescriptor(format!(
                "unknown bloom method {:#04x}",
                method
            )));
        }
        if lg_bits == 0 || lg_bits > MAX_LG_BITS || n_hash == 0 || n_hash > MAX_HASHES {
            return Err(CcnxError::InvalidDescriptor(format!(
                "bad bloom parameters lg_bits={} n_hash={}",
                lg_bits, n_hash
            )));
        }
        let bits = &buf[BLOOM_HEADER_SIZE..];
        if bits.len() > MAX_BLOOM_BYTES {
            return Err(CcnxError::InvalidDescriptor(format!(
                "bloom bit array of {} bytes exceeds {}",
                bits.len(),
                MAX_BLOOM_BYTES
            )));
        }
        let seed = [buf[4], buf[5], buf[6], buf[7]];
        Ok(Self {
            lg_bits,
            n_hash,
            seed,
            bits,
        })
    }

    /// Returns true if the component may be in the filter.
    pub fn matches(&self, data: &[u8]) -> bool {
        bit_positions(&self.seed, self.lg_bits, self.n_hash, self.bits.len(), data)
            .all(|h| self.bits[h >> 3] & (1 << (h & 7)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nexthash_stays_31_bit() {
        let mut s = 0x7FFF_FFFF;
        for u in 0..1000u32 {
            s = nexthash(s, u & 0xFF);
            assert!(s <= 0x7FFF_FFFF);
        }
    }

    #[test]
    fn test_inserted_members_match() {
        let mut bloom = BloomFilter::new(10, 4, [1, 2, 3, 4]).unwrap();
        let members: Vec<Vec<u8>> = (0..40u32).map(|i| format!("seg{}", i).into_bytes()).collect();
        for m in &members {
            bloom.insert(m);
        }
        for m in &members {
            assert!(bloom.matches(m));
        }
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let bloom = BloomFilter::new(6, 3, [0; 4]).unwrap();
        assert!(!bloom.matches(b"anything"));
        assert!(!bloom.matches(b""));
    }

    #[test]
    fn test_false_positive_rate_is_low() {
        let mut bloom = BloomFilter::with_capacity(20, [9, 9, 9, 9]);
        for i in 0..20u32 {
            bloom.insert(&i.to_be_bytes());
        }
        let hits = (1000..3000u32)
            .filter(|i| bloom.matches(&i.to_be_bytes()))
            .count();
        assert!(hits < 200, "too many false positives: {}", hits);
    }

    #[test]
    fn test_wire_form() {
        let mut bloom = BloomFilter::new(4, 2, [0, 0, 0, 7]).unwrap();
        bloom.insert(b"c");
        let wire = bloom.to_bytes();
        assert_eq!(&wire[..8], &[4, 2, b'A', 0, 0, 0, 0, 7]);
        assert_eq!(wire.len(), 8 + 2);

        let parsed = BloomFilter::from_bytes(&wire).unwrap();
        assert_eq!(parsed, bloom);
        assert!(BloomRef::parse(&wire).unwrap().matches(b"c"));
    }

    #[test]
    fn test_seed_changes_positions() {
        let mut a = BloomFilter::new(8, 3, [0, 0, 0, 1]).unwrap();
        let mut b = BloomFilter::new(8, 3, [0, 0, 0, 2]).unwrap();
        a.insert(b"same");
        b.insert(b"same");
        assert_ne!(a.to_bytes()[8..], b.to_bytes()[8..]);
    }

    #[test]
    fn test_parse_rejects_bad_wire() {
        assert!(BloomRef::parse(&[3, 1, b'A', 0, 0, 0, 0, 0]).is_err());
        assert!(BloomRef::parse(&[3, 1, b'B', 0, 0, 0, 0, 0, 0]).is_err());
        assert!(BloomRef::parse(&[3, 0, b'A', 0, 0, 0, 0, 0, 0]).is_err());
        assert!(BloomRef::parse(&[14, 1, b'A', 0, 0, 0, 0, 0, 0]).is_err());
        let mut long = vec![13, 1, b'A', 0, 0, 0, 0, 0];
        long.extend(std::iter::repeat_n(0u8, MAX_BLOOM_BYTES + 1));
        assert!(BloomRef::parse(&long).is_err());
    }

    #[test]
    fn test_new_rejects_bad_parameters() {
        assert!(BloomFilter::new(2, 1, [0; 4]).is_err());
        assert!(BloomFilter::new(14, 1, [0; 4]).is_err());
        assert!(BloomFilter::new(8, 0, [0; 4]).is_err());
    }
}
