//! veil-crypto: cipher primitives for the veilfs encryption layer
//!
//! Everything the engine needs from cryptography sits behind four calls:
//!
//! ```text
//! encode(buf, key, nonce, offset)   positional ChaCha20 (64-bit nonce, seekable)
//! decode(buf, key, nonce, offset)   inverse of encode
//! crc32(bytes)                      header payload checksum
//! random_fill(buf)                  header/tail filler
//! ```
//!
//! Key hierarchy:
//! ```text
//! Entity Key (256-bit, supplied by the key agent or administrator)
//!   └── File Key (per-file, 256-bit random, stored in the header key slot
//!       encrypted under the entity key + file nonce)
//!       └── Data: ChaCha20 keystream at byte offset = logical file offset
//! ```

pub mod checksum;
pub mod cipher;
pub mod keys;

pub use checksum::{crc32, random_fill};
pub use cipher::{decode, encode};
pub use keys::{generate_file_key, generate_nonce, unwrap_key, wrap_key, EntityKey, FileKey};

/// Size of an entity or file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the per-file nonce (64-bit)
pub const NONCE_SIZE: usize = 8;
