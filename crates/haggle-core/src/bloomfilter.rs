//! Bloom filters summarizing the data objects a node has received
//!
//! Two variants exist: a counting filter used by the local node (deletions
//! decrement) and a plain bit filter used for compact transmission inside
//! node descriptions. Hash indexes are derived deterministically from SHA-1
//! so that any node can evaluate any other node's filter.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Default number of hash functions
pub const DEFAULT_NUM_HASHES: u32 = 7;
/// Default filter width in bits
pub const DEFAULT_NUM_BITS: u32 = 8192;

const TYPE_PLAIN: u8 = 1;
const TYPE_COUNTING: u8 = 2;
/// type + hash count + bit length
const HEADER_LEN: usize = 9;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
enum Repr {
    /// One bit per slot
    Plain(Vec<u8>),
    /// One u16 counter per slot
    Counting(Vec<u16>),
}

/// A self-describing bloom filter over 20-byte data-object ids
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bloomfilter {
    hashes: u32,
    bits: u32,
    insertions: u32,
    repr: Repr,
}

impl Bloomfilter {
    /// New counting filter with default dimensions
    pub fn counting() -> Self {
        Self::counting_with(DEFAULT_NUM_HASHES, DEFAULT_NUM_BITS)
    }

    pub fn counting_with(hashes: u32, bits: u32) -> Self {
        Bloomfilter {
            hashes,
            bits,
            insertions: 0,
            repr: Repr::Counting(vec![0; bits as usize]),
        }
    }

    /// New plain (non-counting) filter with default dimensions
    pub fn plain() -> Self {
        Self::plain_with(DEFAULT_NUM_HASHES, DEFAULT_NUM_BITS)
    }

    pub fn plain_with(hashes: u32, bits: u32) -> Self {
        Bloomfilter {
            hashes,
            bits,
            insertions: 0,
            repr: Repr::Plain(vec![0; bits.div_ceil(8) as usize]),
        }
    }

    pub fn is_counting(&self) -> bool {
        matches!(self.repr, Repr::Counting(_))
    }

    /// Number of successful insertions (approximate set size)
    pub fn len(&self) -> u32 {
        self.insertions
    }

    pub fn is_empty(&self) -> bool {
        self.insertions == 0
    }

    /// Slot indexes for a key: double hashing over the SHA-1 of the key
    fn indexes(&self, key: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let digest = Sha1::digest(key);
        let a = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        let b = u32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]);
        let bits = self.bits;
        (0..self.hashes).map(move |i| (a.wrapping_add(i.wrapping_mul(b)) % bits) as usize)
    }

    pub fn add(&mut self, key: &[u8]) {
        let slots: Vec<usize> = self.indexes(key).collect();
        match &mut self.repr {
            Repr::Plain(data) => {
                for slot in slots {
                    data[slot / 8] |= 1 << (slot % 8);
                }
            }
            Repr::Counting(counters) => {
                for slot in slots {
                    counters[slot] = counters[slot].saturating_add(1);
                }
            }
        }
        self.insertions = self.insertions.saturating_add(1);
    }

    /// Remove a key. Only meaningful on counting filters; a no-op on plain
    /// ones.
    pub fn remove(&mut self, key: &[u8]) {
        let slots: Vec<usize> = self.indexes(key).collect();
        if let Repr::Counting(counters) = &mut self.repr {
            if slots.iter().all(|&s| counters[s] > 0) {
                for slot in slots {
                    counters[slot] -= 1;
                }
                self.insertions = self.insertions.saturating_sub(1);
            }
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.indexes(key).all(|slot| match &self.repr {
            Repr::Plain(data) => data[slot / 8] & (1 << (slot % 8)) != 0,
            Repr::Counting(counters) => counters[slot] > 0,
        })
    }

    /// Project a counting filter to the plain form used on the wire; a plain
    /// filter is returned as a copy
    pub fn to_plain(&self) -> Bloomfilter {
        match &self.repr {
            Repr::Plain(_) => self.clone(),
            Repr::Counting(counters) => {
                let mut data = vec![0u8; self.bits.div_ceil(8) as usize];
                for (slot, &c) in counters.iter().enumerate() {
                    if c > 0 {
                        data[slot / 8] |= 1 << (slot % 8);
                    }
                }
                Bloomfilter {
                    hashes: self.hashes,
                    bits: self.bits,
                    insertions: self.insertions,
                    repr: Repr::Plain(data),
                }
            }
        }
    }

    /// OR-merge another filter of identical shape into this one
    pub fn merge(&mut self, other: &Bloomfilter) -> Result<()> {
        if other.hashes != self.hashes || other.bits != self.bits {
            return Err(Error::Bloomfilter(format!(
                "shape mismatch: {}x{} vs {}x{}",
                self.hashes, self.bits, other.hashes, other.bits
            )));
        }
        let other_plain = other.to_plain();
        let Repr::Plain(theirs) = &other_plain.repr else {
            unreachable!()
        };
        match &mut self.repr {
            Repr::Plain(ours) => {
                for (o, t) in ours.iter_mut().zip(theirs.iter()) {
                    *o |= t;
                }
            }
            Repr::Counting(counters) => {
                // Merging into a counting filter sets absent slots to one so
                // membership is preserved; exact counts cannot be recovered
                for (slot, counter) in counters.iter_mut().enumerate() {
                    if *counter == 0 && theirs[slot / 8] & (1 << (slot % 8)) != 0 {
                        *counter = 1;
                    }
                }
            }
        }
        self.insertions = self.insertions.max(other.insertions);
        Ok(())
    }

    /// Self-describing byte form: `{type u8, hash count u32, bit length u32,
    /// data}` with big-endian integers
    pub fn to_bytes(&self) -> Vec<u8> {
        let (ty, data): (u8, Vec<u8>) = match &self.repr {
            Repr::Plain(data) => (TYPE_PLAIN, data.clone()),
            Repr::Counting(counters) => (
                TYPE_COUNTING,
                counters.iter().flat_map(|c| c.to_be_bytes()).collect(),
            ),
        };
        let mut out = Vec::with_capacity(HEADER_LEN + data.len());
        out.push(ty);
        out.extend_from_slice(&self.hashes.to_be_bytes());
        out.extend_from_slice(&self.bits.to_be_bytes());
        out.extend_from_slice(&data);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Bloomfilter> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::Bloomfilter("short filter header".into()));
        }
        let ty = bytes[0];
        let hashes = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        let bits = u32::from_be_bytes(bytes[5..9].try_into().unwrap());
        if hashes == 0 || bits == 0 {
            return Err(Error::Bloomfilter("degenerate filter shape".into()));
        }
        let data = &bytes[HEADER_LEN..];
        let repr = match ty {
            TYPE_PLAIN => {
                if data.len() != bits.div_ceil(8) as usize {
                    return Err(Error::Bloomfilter("bit data length mismatch".into()));
                }
                Repr::Plain(data.to_vec())
            }
            TYPE_COUNTING => {
                if data.len() != bits as usize * 2 {
                    return Err(Error::Bloomfilter("counter data length mismatch".into()));
                }
                Repr::Counting(
                    data.chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                )
            }
            other => return Err(Error::Bloomfilter(format!("unknown filter type {other}"))),
        };
        Ok(Bloomfilter {
            hashes,
            bits,
            insertions: 0,
            repr,
        })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    pub fn from_base64(s: &str) -> Result<Bloomfilter> {
        Self::from_bytes(&BASE64.decode(s.trim())?)
    }
}

impl Default for Bloomfilter {
    fn default() -> Self {
        Self::plain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> [u8; 20] {
        [n; 20]
    }

    #[test]
    fn test_add_contains() {
        let mut bf = Bloomfilter::counting();
        assert!(!bf.contains(&id(1)));
        bf.add(&id(1));
        assert!(bf.contains(&id(1)));
        assert!(!bf.contains(&id(2)));
    }

    #[test]
    fn test_counting_remove() {
        let mut bf = Bloomfilter::counting();
        bf.add(&id(1));
        bf.add(&id(2));
        bf.remove(&id(1));
        assert!(!bf.contains(&id(1)));
        assert!(bf.contains(&id(2)));
        assert_eq!(bf.len(), 1);
    }

    #[test]
    fn test_plain_remove_is_noop() {
        let mut bf = Bloomfilter::plain();
        bf.add(&id(3));
        bf.remove(&id(3));
        assert!(bf.contains(&id(3)));
    }

    #[test]
    fn test_projection_preserves_membership() {
        let mut bf = Bloomfilter::counting();
        for n in 0..50 {
            bf.add(&id(n));
        }
        let plain = bf.to_plain();
        assert!(!plain.is_counting());
        for n in 0..50 {
            assert!(plain.contains(&id(n)));
        }
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut bf = Bloomfilter::counting();
        bf.add(&id(7));
        bf.add(&id(9));

        let decoded = Bloomfilter::from_bytes(&bf.to_bytes()).unwrap();
        assert!(decoded.is_counting());
        assert!(decoded.contains(&id(7)));
        assert!(decoded.contains(&id(9)));
        assert!(!decoded.contains(&id(8)));

        let plain = bf.to_plain();
        let decoded = Bloomfilter::from_base64(&plain.to_base64()).unwrap();
        assert!(decoded.contains(&id(7)));
    }

    #[test]
    fn test_merge() {
        let mut a = Bloomfilter::plain();
        let mut b = Bloomfilter::plain();
        a.add(&id(1));
        b.add(&id(2));
        a.merge(&b).unwrap();
        assert!(a.contains(&id(1)));
        assert!(a.contains(&id(2)));

        let odd = Bloomfilter::plain_with(3, 64);
        assert!(a.merge(&odd).is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(Bloomfilter::from_bytes(&[1, 2, 3]).is_err());
        assert!(Bloomfilter::from_bytes(&[9, 0, 0, 0, 7, 0, 0, 32, 0]).is_err());
    }
}
