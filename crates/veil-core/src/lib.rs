pub mod config;
pub mod error;
pub mod types;

pub use error::{CfsError, CfsResult, IntegrityError};
pub use types::{
    EntityId, FileId, FileKind, HandleId, HeaderId, NormalizedPath, SessionId, StackKind,
};
