//! Bloom filters for broadcast filtering.
//!
//! Senders attach a bloom filter to each broadcast describing what the
//! message is about (interface, member, path, ...). Receivers install match
//! rules carrying a mask built the same way; a broadcast is interesting when
//! every bit of the mask is set in the message's filter.
//!
//! The filter size is fixed per bus at creation time. Each datum sets
//! [`BLOOM_HASH_FUNCTIONS`] bits, taken from successive 8-byte words of the
//! datum's BLAKE3 extended output. False positives are possible, false
//! negatives are not.

use std::fmt;

use bytes::Bytes;

use crate::error::{BusError, BusResult};

/// Bits set per added datum.
pub const BLOOM_HASH_FUNCTIONS: usize = 8;

/// A fixed-size bloom filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Creates an empty filter of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] unless `size` is a non-zero
    /// multiple of 8.
    pub fn new(size: usize) -> BusResult<Self> {
        check_size(size)?;
        Ok(Self {
            bits: vec![0; size],
        })
    }

    /// Wraps existing filter bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidArgument`] unless the length is a non-zero
    /// multiple of 8.
    pub fn from_bytes(bytes: &[u8]) -> BusResult<Self> {
        check_size(bytes.len())?;
        Ok(Self {
            bits: bytes.to_vec(),
        })
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bits.len()
    }

    /// Adds one datum.
    pub fn add(&mut self, data: &[u8]) {
        let nbits = (self.bits.len() as u64) * 8;
        for bit in bit_indexes(data, nbits) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// Adds one datum, builder style.
    #[must_use]
    pub fn with(mut self, data: &[u8]) -> Self {
        self.add(data);
        self
    }

    /// Returns `true` if `data` may have been added.
    #[must_use]
    pub fn may_contain(&self, data: &[u8]) -> bool {
        let nbits = (self.bits.len() as u64) * 8;
        bit_indexes(data, nbits).all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Returns `true` if every bit set here is also set in `filter`.
    #[must_use]
    pub fn is_subset_of(&self, filter: &[u8]) -> bool {
        is_subset(&self.bits, filter)
    }

    /// Raw filter bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Converts into an item payload.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.bits)
    }
}

impl fmt::Display for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.bits))
    }
}

/// Returns `true` if every bit of `mask` is set in `filter`.
///
/// Filters of different sizes never match.
#[must_use]
pub fn is_subset(mask: &[u8], filter: &[u8]) -> bool {
    mask.len() == filter.len() && mask.iter().zip(filter).all(|(m, f)| m & f == *m)
}

fn check_size(size: usize) -> BusResult<()> {
    if size == 0 || size % 8 != 0 {
        return Err(BusError::invalid_argument(format!(
            "bloom size {size} is not a non-zero multiple of 8"
        )));
    }
    Ok(())
}

fn bit_indexes(data: &[u8], nbits: u64) -> impl Iterator<Item = u64> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(data);
    let mut reader = hasher.finalize_xof();
    (0..BLOOM_HASH_FUNCTIONS).map(move |_| {
        let mut word = [0u8; 8];
        reader.fill(&mut word);
        u64::from_le_bytes(word) % nbits
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_size_must_be_multiple_of_eight() {
        assert!(BloomFilter::new(0).is_err());
        assert!(BloomFilter::new(12).is_err());
        assert_eq!(BloomFilter::new(64).unwrap().size(), 64);
    }

    #[test]
    fn test_added_data_is_found() {
        let filter = BloomFilter::new(64)
            .unwrap()
            .with(b"interface:org.example.Iface")
            .with(b"member:Changed");
        assert!(filter.may_contain(b"interface:org.example.Iface"));
        assert!(filter.may_contain(b"member:Changed"));
    }

    #[test]
    fn test_mask_subset_of_message_filter() {
        let mask = BloomFilter::new(64).unwrap().with(b"member:Changed");
        let message = BloomFilter::new(64)
            .unwrap()
            .with(b"interface:org.example.Iface")
            .with(b"member:Changed");
        assert!(mask.is_subset_of(message.as_bytes()));

        let unrelated = BloomFilter::new(64).unwrap().with(b"member:Other");
        // 8 bits out of 512; a collision on all of them is not realistic.
        assert!(!mask.is_subset_of(unrelated.as_bytes()));
    }

    #[test]
    fn test_size_mismatch_never_matches() {
        let mask = BloomFilter::new(8).unwrap();
        assert!(!is_subset(mask.as_bytes(), &[0u8; 16]));
    }

    #[test]
    fn test_display_is_hex() {
        let filter = BloomFilter::from_bytes(&[0xab; 8]).unwrap();
        assert_eq!(filter.to_string(), "abababababababab");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// A filter containing everything the mask was built from always
        /// matches; clearing any required bit never matches.
        #[test]
        fn prop_bloom_has_no_false_negatives(
            words in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..16), 1..6),
            extra in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..16), 0..6),
            clear_pick in any::<prop::sample::Index>(),
        ) {
            let mut mask = BloomFilter::new(32).unwrap();
            for word in &words {
                mask.add(word);
            }
            let mut message = mask.clone();
            for word in &extra {
                message.add(word);
            }
            prop_assert!(mask.is_subset_of(message.as_bytes()));

            let set_bits: Vec<usize> = (0..mask.size() * 8)
                .filter(|bit| mask.as_bytes()[bit / 8] & (1 << (bit % 8)) != 0)
                .collect();
            let bit = set_bits[clear_pick.index(set_bits.len())];
            let mut missing = message.as_bytes().to_vec();
            missing[bit / 8] &= !(1 << (bit % 8));
            prop_assert!(!mask.is_subset_of(&missing));
        }
    }
}
