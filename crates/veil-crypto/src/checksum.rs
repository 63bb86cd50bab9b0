//! CRC32 and random filler

use rand::RngCore;

/// CRC32 (IEEE) of `bytes`.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Fill `buf` with bytes from the thread-local CSPRNG.
pub fn random_fill(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_vector() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn random_fill_is_not_constant() {
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        random_fill(&mut a);
        random_fill(&mut b);
        assert_ne!(a, b);
        assert_ne!(a, [0u8; 64]);
    }
}
