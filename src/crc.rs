//! CRC32C (Castagnoli) primitives shared by the data log and the bucket
//! index: the same construction checksums a payload and hashes a key.

/// CRC32C of `bytes`, using the Castagnoli polynomial.
///
/// Used two ways in this crate: over an entry's payload to produce its
/// stored integrity field, and over a key to pick its bucket. Both uses
/// process the whole input in one call — there is no meaningful
/// byte-at-a-time tail case to special-case here, the `crc32c` crate
/// handles lengths down to zero directly.
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Hash a key into a bucket index for a table of `2^bucket_bits` buckets.
pub fn bucket_hash(key: &[u8], bucket_bits: u8) -> usize {
    let mask = bucket_mask(bucket_bits);
    (checksum(key) as usize) & mask
}

/// `2^bucket_bits - 1`, the mask applied to a hash to select a bucket.
pub fn bucket_mask(bucket_bits: u8) -> usize {
    debug_assert!((1..=32).contains(&bucket_bits));
    if bucket_bits >= usize::BITS as u8 {
        usize::MAX
    } else {
        (1usize << bucket_bits) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_empty_is_zero() {
        assert_eq!(checksum(b""), 0);
    }

    #[test]
    fn checksum_is_deterministic() {
        assert_eq!(checksum(b"hello world"), checksum(b"hello world"));
    }

    #[test]
    fn checksum_distinguishes_payloads() {
        assert_ne!(checksum(b"hello"), checksum(b"world"));
    }

    #[test]
    fn bucket_hash_stays_within_table() {
        let bits = 4;
        for key in [&b"a"[..], b"bb", b"ccc", b"a-much-longer-key-than-the-rest"] {
            assert!(bucket_hash(key, bits) < (1 << bits));
        }
    }

    #[test]
    fn bucket_mask_covers_full_usize_range_at_max_bits() {
        assert_eq!(bucket_mask(32), 0xFFFF_FFFF);
    }
}
