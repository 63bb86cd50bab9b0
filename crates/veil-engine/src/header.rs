//! Per-file header block: binary layout, checksum and validation.
//!
//! # Binary Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       4     magic ("VEIL", u32 LE)
//! 4       4     version
//! 8       4     cipher_id (CIPHER_AUTOCONFIG marks a directory policy file)
//! 12      4     block_size (total header bytes, multiple of HEADER_ALIGNMENT)
//! 16      4     payload_size
//! 20      4     payload_crc (CRC32 of payload)
//! 24      4     deepness (DEEPNESS_UNLIMITED = no recursion limit)
//! 28      8     nonce
//! 36      32    encrypted file key
//! 68      N     payload
//! 68+N    ...   random filler up to block_size
//! ```

use veil_core::IntegrityError;
use veil_crypto::{crc32, random_fill, KEY_SIZE};

pub const HEADER_MAGIC: u32 = u32::from_le_bytes(*b"VEIL");
pub const HEADER_VERSION: u32 = 1;

/// Every header block size is a multiple of this.
pub const HEADER_ALIGNMENT: u32 = 512;
pub const FIXED_HEADER_SIZE: u32 = 68;
pub const MAX_HEADER_SIZE: u32 = 64 * 1024;

/// The only data cipher: positional ChaCha20.
pub const CIPHER_CHACHA20: u32 = 1;
/// Sentinel cipher id of AutoConfig headers (no file data behind them).
pub const CIPHER_AUTOCONFIG: u32 = u32::MAX;

pub const DEEPNESS_UNLIMITED: u32 = u32::MAX;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_CIPHER: usize = 8;
const OFF_BLOCK_SIZE: usize = 12;
const OFF_PAYLOAD_SIZE: usize = 16;
const OFF_PAYLOAD_CRC: usize = 20;
const OFF_DEEPNESS: usize = 24;
const OFF_NONCE: usize = 28;
const OFF_FILE_KEY: usize = 36;

/// Decoded header block.
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub cipher_id: u32,
    pub block_size: u32,
    pub deepness: u32,
    pub nonce: u64,
    pub encrypted_file_key: [u8; KEY_SIZE],
    pub payload: Vec<u8>,
}

/// Fields readable from the first alignment unit of a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderPrefix {
    pub block_size: u32,
    pub payload_size: u32,
}

impl Header {
    /// Build a validated header with an empty key slot and zero nonce.
    pub fn new(
        cipher_id: u32,
        block_size: u32,
        deepness: u32,
        payload: Vec<u8>,
    ) -> Result<Self, IntegrityError> {
        check_bounds(block_size, payload.len() as u64)?;
        Ok(Header {
            version: HEADER_VERSION,
            cipher_id,
            block_size,
            deepness,
            nonce: 0,
            encrypted_file_key: [0u8; KEY_SIZE],
            payload,
        })
    }

    /// Header for a directory's AutoConfig file.
    pub fn autoconfig(payload: Vec<u8>, deepness: u32) -> Result<Self, IntegrityError> {
        let block_size = smallest_block_for(payload.len())?;
        let mut header = Header::new(CIPHER_AUTOCONFIG, block_size, deepness, payload)?;
        random_fill(&mut header.encrypted_file_key);
        header.nonce = veil_crypto::generate_nonce();
        Ok(header)
    }

    pub fn is_autoconfig(&self) -> bool {
        self.cipher_id == CIPHER_AUTOCONFIG
    }

    pub fn payload_crc(&self) -> u32 {
        crc32(&self.payload)
    }

    /// True when both headers carry the same policy (cipher and payload).
    pub fn same_policy(&self, other: &Header) -> bool {
        self.payload == other.payload
    }

    /// Per-file copy of a policy template.
    pub fn for_file(&self, nonce: u64, encrypted_file_key: [u8; KEY_SIZE]) -> Header {
        Header {
            cipher_id: if self.is_autoconfig() {
                CIPHER_CHACHA20
            } else {
                self.cipher_id
            },
            nonce,
            encrypted_file_key,
            ..self.clone()
        }
    }

    /// Same policy with a different block size.
    pub fn with_block_size(&self, block_size: u32) -> Result<Header, IntegrityError> {
        check_bounds(block_size, self.payload.len() as u64)?;
        Ok(Header {
            block_size,
            ..self.clone()
        })
    }

    /// Serialize to exactly `block_size` bytes. Unused bytes are random.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size as usize];
        random_fill(&mut buf);

        put_u32(&mut buf, OFF_MAGIC, HEADER_MAGIC);
        put_u32(&mut buf, OFF_VERSION, self.version);
        put_u32(&mut buf, OFF_CIPHER, self.cipher_id);
        put_u32(&mut buf, OFF_BLOCK_SIZE, self.block_size);
        put_u32(&mut buf, OFF_PAYLOAD_SIZE, self.payload.len() as u32);
        put_u32(&mut buf, OFF_PAYLOAD_CRC, self.payload_crc());
        put_u32(&mut buf, OFF_DEEPNESS, self.deepness);
        buf[OFF_NONCE..OFF_NONCE + 8].copy_from_slice(&self.nonce.to_le_bytes());
        buf[OFF_FILE_KEY..OFF_FILE_KEY + KEY_SIZE].copy_from_slice(&self.encrypted_file_key);

        let start = FIXED_HEADER_SIZE as usize;
        buf[start..start + self.payload.len()].copy_from_slice(&self.payload);
        buf
    }

    /// Validate magic and size bounds from a possibly partial buffer.
    pub fn peek(bytes: &[u8]) -> Result<HeaderPrefix, IntegrityError> {
        if bytes.len() < FIXED_HEADER_SIZE as usize {
            return Err(IntegrityError::Truncated {
                len: bytes.len(),
                needed: FIXED_HEADER_SIZE as usize,
            });
        }
        let magic = get_u32(bytes, OFF_MAGIC);
        if magic != HEADER_MAGIC {
            return Err(IntegrityError::BadMagic { found: magic });
        }
        let version = get_u32(bytes, OFF_VERSION);
        if version != HEADER_VERSION {
            return Err(IntegrityError::UnsupportedVersion(version));
        }
        let block_size = get_u32(bytes, OFF_BLOCK_SIZE);
        let payload_size = get_u32(bytes, OFF_PAYLOAD_SIZE);
        check_bounds(block_size, payload_size as u64)?;
        Ok(HeaderPrefix {
            block_size,
            payload_size,
        })
    }

    /// Decode a header. Magic, then block size bounds, then payload CRC.
    pub fn decode(bytes: &[u8]) -> Result<Header, IntegrityError> {
        let prefix = Header::peek(bytes)?;
        let start = FIXED_HEADER_SIZE as usize;
        let end = start + prefix.payload_size as usize;
        if bytes.len() < end {
            return Err(IntegrityError::Truncated {
                len: bytes.len(),
                needed: end,
            });
        }
        let payload = bytes[start..end].to_vec();
        let stored = get_u32(bytes, OFF_PAYLOAD_CRC);
        let computed = crc32(&payload);
        if stored != computed {
            return Err(IntegrityError::PayloadCrc { stored, computed });
        }

        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[OFF_NONCE..OFF_NONCE + 8]);
        let mut encrypted_file_key = [0u8; KEY_SIZE];
        encrypted_file_key.copy_from_slice(&bytes[OFF_FILE_KEY..OFF_FILE_KEY + KEY_SIZE]);

        Ok(Header {
            version: get_u32(bytes, OFF_VERSION),
            cipher_id: get_u32(bytes, OFF_CIPHER),
            block_size: prefix.block_size,
            deepness: get_u32(bytes, OFF_DEEPNESS),
            nonce: u64::from_le_bytes(nonce),
            encrypted_file_key,
            payload,
        })
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Header")
            .field("version", &self.version)
            .field("cipher_id", &self.cipher_id)
            .field("block_size", &self.block_size)
            .field("deepness", &self.deepness)
            .field("nonce", &format_args!("{:#018x}", self.nonce))
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Smallest aligned block that fits the fixed fields and `payload_len`.
pub fn smallest_block_for(payload_len: usize) -> Result<u32, IntegrityError> {
    let needed = FIXED_HEADER_SIZE as u64 + payload_len as u64;
    let block = needed.div_ceil(HEADER_ALIGNMENT as u64) * HEADER_ALIGNMENT as u64;
    if block > MAX_HEADER_SIZE as u64 {
        return Err(IntegrityError::BlockSize {
            block_size: block.min(u32::MAX as u64) as u32,
            payload_size: payload_len.min(u32::MAX as usize) as u32,
        });
    }
    Ok(block as u32)
}

fn check_bounds(block_size: u32, payload_size: u64) -> Result<(), IntegrityError> {
    let ok = block_size >= HEADER_ALIGNMENT
        && block_size % HEADER_ALIGNMENT == 0
        && block_size <= MAX_HEADER_SIZE
        && FIXED_HEADER_SIZE as u64 + payload_size <= block_size as u64;
    if ok {
        Ok(())
    } else {
        Err(IntegrityError::BlockSize {
            block_size,
            payload_size: payload_size.min(u32::MAX as u64) as u32,
        })
    }
}

fn put_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
