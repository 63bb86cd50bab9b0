//! Key types, file key generation, header key-slot wrapping

use rand::RngCore;
use zeroize::Zeroize;

use crate::cipher::apply_keystream;
use crate::KEY_SIZE;

/// A per-file 256-bit data key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A policy (entity) key that protects the file keys of every file under the
/// entity. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct EntityKey {
    bytes: [u8; KEY_SIZE],
}

impl EntityKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build a key from an arbitrary slice; it must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != KEY_SIZE {
            anyhow::bail!(
                "entity key has wrong size: {} bytes (expected {})",
                bytes.len(),
                KEY_SIZE
            );
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self { bytes: key })
    }

    /// Parse a standard base64 key.
    pub fn from_base64(text: &str) -> anyhow::Result<Self> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let mut raw = STANDARD
            .decode(text.trim())
            .map_err(|e| anyhow::anyhow!("base64 decode: {e}"))?;
        let key = Self::from_slice(&raw);
        raw.zeroize();
        key
    }

    pub fn to_base64(&self) -> String {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        STANDARD.encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for EntityKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file key.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// Generate a random per-file nonce.
pub fn generate_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

/// Encrypt a file key into the fixed 32-byte header slot.
///
/// The slot has no room for an authentication tag: the key is XORed with the
/// entity-key keystream at position 0 for this file's nonce. File data never
/// uses the entity key, so the keystream is not reused.
pub fn wrap_key(entity: &EntityKey, nonce: u64, file_key: &FileKey) -> anyhow::Result<[u8; KEY_SIZE]> {
    let mut slot = *file_key.as_bytes();
    apply_keystream(&mut slot, entity.as_bytes(), nonce, 0)?;
    Ok(slot)
}

/// Recover a file key from a header slot.
pub fn unwrap_key(entity: &EntityKey, nonce: u64, slot: &[u8; KEY_SIZE]) -> anyhow::Result<FileKey> {
    let mut bytes = *slot;
    apply_keystream(&mut bytes, entity.as_bytes(), nonce, 0)?;
    let key = FileKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_entity_key() -> EntityKey {
        EntityKey::from_bytes([42u8; KEY_SIZE])
    }

    #[test]
    fn test_file_key_generation() {
        let k1 = generate_file_key();
        let k2 = generate_file_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_key_wrap_unwrap_roundtrip() {
        let entity = test_entity_key();
        let file_key = generate_file_key();

        let slot = wrap_key(&entity, 77, &file_key).unwrap();
        assert_ne!(&slot, file_key.as_bytes());
        let unwrapped = unwrap_key(&entity, 77, &slot).unwrap();

        assert_eq!(file_key.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_key_unwrap_wrong_entity_key() {
        let file_key = generate_file_key();
        let slot = wrap_key(&EntityKey::from_bytes([1u8; KEY_SIZE]), 5, &file_key).unwrap();
        let other = unwrap_key(&EntityKey::from_bytes([2u8; KEY_SIZE]), 5, &slot).unwrap();

        assert_ne!(other.as_bytes(), file_key.as_bytes());
    }

    #[test]
    fn test_entity_key_base64() {
        let key = test_entity_key();
        let parsed = EntityKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(parsed, key);
        assert!(EntityKey::from_base64("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_debug_redacts() {
        let rendered = format!("{:?}", test_entity_key());
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("42"));
    }
}
