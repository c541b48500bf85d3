//! Payload masking per [RFC 6455 Section 5.3](https://datatracker.ietf.org/doc/html/rfc6455#section-5.3).

/// Draws a fresh 4-byte masking key from the thread-local CSPRNG.
///
/// A new key is generated for every outbound client frame; servers never
/// mask.
#[inline]
pub(crate) fn make_masking_key() -> [u8; 4] {
    rand::random()
}

/// XORs `key` over `buf` in place. The operation is its own inverse.
///
/// The key is widened to a big-endian `u32` and applied word-at-a-time over
/// the aligned 4-byte chunks; the trailing 0-3 bytes are XORed individually
/// with `key[i % 4]`.
pub(crate) fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_be_bytes(key);

    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_be_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-at-a-time reference implementation.
    fn apply_mask_naive(buf: &mut [u8], key: [u8; 4]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }

    #[test]
    fn test_matches_naive() {
        let key = [0x6d, 0xb6, 0xb2, 0x80];
        let data: Vec<u8> = (0..67).map(|i| (i * 31) as u8).collect();

        for len in 0..=data.len() {
            let mut fast = data[..len].to_vec();
            let mut naive = data[..len].to_vec();
            apply_mask(&mut fast, key);
            apply_mask_naive(&mut naive, key);
            assert_eq!(fast, naive, "mismatch at len {len}");
        }
    }

    #[test]
    fn test_involution() {
        let key = [0xaa, 0xbb, 0xcc, 0xdd];
        let original = b"The quick brown fox jumps over the lazy dog".to_vec();

        let mut data = original.clone();
        apply_mask(&mut data, key);
        assert_ne!(data, original);

        apply_mask(&mut data, key);
        assert_eq!(data, original);
    }

    #[test]
    fn test_zero_key_is_identity() {
        let mut data = b"identity".to_vec();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(&data, b"identity");
    }

    #[test]
    fn test_short_tails() {
        let key = [0x12, 0x34, 0x56, 0x78];

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, key);
        assert!(empty.is_empty());

        let mut one = vec![0xab];
        apply_mask(&mut one, key);
        assert_eq!(one, vec![0xab ^ 0x12]);

        let mut three = vec![0xab, 0xcd, 0xef];
        apply_mask(&mut three, key);
        assert_eq!(three, vec![0xab ^ 0x12, 0xcd ^ 0x34, 0xef ^ 0x56]);
    }

    #[test]
    fn test_large_buffer() {
        let key = [0x01, 0x02, 0x03, 0x04];
        let original: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();

        let mut data = original.clone();
        apply_mask(&mut data, key);
        for (i, &byte) in data.iter().enumerate() {
            assert_eq!(byte, original[i] ^ key[i % 4], "mismatch at index {i}");
        }
    }

    #[test]
    fn test_fresh_keys() {
        // Not a randomness test, just a sanity check that consecutive keys
        // are not stuck on a constant.
        let keys: Vec<[u8; 4]> = (0..16).map(|_| make_masking_key()).collect();
        assert!(keys.windows(2).any(|w| w[0] != w[1]));
    }
}
