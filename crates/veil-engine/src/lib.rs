//! veil-engine: transparent per-file encryption over a storage stack.
//!
//! Encrypted files carry a header block in front of the data and a padding
//! block behind it:
//!
//! ```text
//! [header (block_size)] [ciphertext (L)] [filler] [padding block (512)]
//! ```
//!
//! Which files get encrypted is decided by policy entities (explicit,
//! discovered from AutoConfig files, or re-attached after an escape).
//! [`Engine`] is the facade tying the pieces together.

pub mod aligned;
pub mod autoconfig;
pub mod broker;
pub mod cipher;
pub mod engine;
pub mod entity;
pub mod escape;
pub mod header;
pub mod headers;
pub mod io;
pub mod migrate;
pub mod negative_cache;
pub mod path;
pub mod tail;
pub mod tracker;

pub use broker::{KeyAgent, KeyBroker, KeyRequest};
pub use cipher::{CipherManager, HeaderProbe, TailInfo};
pub use engine::{Disposition, Engine, EntitySpec, OpenRequest};
pub use entity::{EntityMatch, EntityOrigin, EntityRecord, MatchKind};
pub use header::{Header, CIPHER_AUTOCONFIG, CIPHER_CHACHA20, DEEPNESS_UNLIMITED};
pub use io::FileSizes;
pub use migrate::{FileCrypto, MigrationReport};
pub use path::RawName;
