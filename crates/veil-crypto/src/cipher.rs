//! Positional stream cipher for file data.
//!
//! ChaCha20 with a 64-bit nonce and a 64-bit block counter. The keystream
//! position equals the logical byte offset in the file, so any sub-range of a
//! file can be encrypted or decrypted independently of its neighbours:
//!
//! ```text
//! ciphertext[i] = plaintext[i] ^ keystream(key, nonce)[offset + i]
//! ```
//!
//! Length is preserved, which lets the I/O path rewrite a partial block in
//! place without touching the bytes around it.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20Legacy;

use crate::keys::FileKey;
use crate::{KEY_SIZE, NONCE_SIZE};

/// Encrypt `buf` in place as the bytes at `offset` of a file.
pub fn encode(buf: &mut [u8], key: &FileKey, nonce: u64, offset: u64) -> anyhow::Result<()> {
    apply_keystream(buf, key.as_bytes(), nonce, offset)
}

/// Decrypt `buf` in place as the bytes at `offset` of a file.
pub fn decode(buf: &mut [u8], key: &FileKey, nonce: u64, offset: u64) -> anyhow::Result<()> {
    apply_keystream(buf, key.as_bytes(), nonce, offset)
}

pub(crate) fn apply_keystream(
    buf: &mut [u8],
    key: &[u8; KEY_SIZE],
    nonce: u64,
    offset: u64,
) -> anyhow::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let nonce_bytes: [u8; NONCE_SIZE] = nonce.to_le_bytes();
    let mut cipher = ChaCha20Legacy::new(key.into(), (&nonce_bytes).into());
    cipher
        .try_seek(offset)
        .map_err(|e| anyhow::anyhow!("keystream seek to {offset} failed: {e}"))?;
    cipher
        .try_apply_keystream(buf)
        .map_err(|e| anyhow::anyhow!("keystream exhausted at offset {offset}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_file_key;
    use proptest::prelude::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = generate_file_key();
        let plaintext = b"hello, encrypted world!".to_vec();

        let mut buf = plaintext.clone();
        encode(&mut buf, &key, 7, 0).unwrap();
        assert_ne!(buf, plaintext);
        decode(&mut buf, &key, 7, 0).unwrap();

        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_partial_range_matches_whole() {
        let key = FileKey::from_bytes([9u8; KEY_SIZE]);
        let plaintext: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

        let mut whole = plaintext.clone();
        encode(&mut whole, &key, 1, 0).unwrap();

        // Encrypting bytes 1000..1777 alone yields the same ciphertext
        let mut part = plaintext[1000..1777].to_vec();
        encode(&mut part, &key, 1, 1000).unwrap();
        assert_eq!(&whole[1000..1777], &part[..]);
    }

    #[test]
    fn test_wrong_nonce_does_not_decrypt() {
        let key = generate_file_key();
        let mut buf = b"secret data".to_vec();
        encode(&mut buf, &key, 1, 0).unwrap();
        decode(&mut buf, &key, 2, 0).unwrap();
        assert_ne!(&buf, b"secret data");
    }

    #[test]
    fn test_empty_buffer() {
        let key = generate_file_key();
        let mut buf: Vec<u8> = Vec::new();
        encode(&mut buf, &key, 0, u64::MAX / 2).unwrap();
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn prop_positional_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            nonce in any::<u64>(),
            offset in 0u64..(1 << 40),
            key_byte in any::<u8>(),
        ) {
            let key = FileKey::from_bytes([key_byte; KEY_SIZE]);
            let mut buf = data.clone();
            encode(&mut buf, &key, nonce, offset).unwrap();
            decode(&mut buf, &key, nonce, offset).unwrap();
            prop_assert_eq!(buf, data);
        }
    }
}
