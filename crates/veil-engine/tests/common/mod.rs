//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use veil_core::config::VeilConfig;
use veil_core::{FileKind, NormalizedPath, SessionId};
use veil_crypto::EntityKey;
use veil_engine::{Engine, EntitySpec, OpenRequest};
use veil_storage::{MemoryStack, StorageStack};

pub const S1: SessionId = SessionId(1);
pub const S2: SessionId = SessionId(2);

pub fn key(byte: u8) -> EntityKey {
    EntityKey::from_bytes([byte; 32])
}

pub fn config() -> VeilConfig {
    let mut config = VeilConfig::default();
    config.broker.timeout_ms = 200;
    config.broker.backoff_ms = 5;
    config
}

pub fn engine_with(config: VeilConfig) -> (Arc<MemoryStack>, Engine) {
    let stack = Arc::new(MemoryStack::new().with_strict_alignment());
    let storage: Arc<dyn StorageStack> = stack.clone();
    let engine = Engine::new(config, storage).expect("engine");
    (stack, engine)
}

pub fn engine() -> (Arc<MemoryStack>, Engine) {
    engine_with(config())
}

pub fn dir(parts: &[&str]) -> NormalizedPath {
    NormalizedPath::directory("c", parts)
}

pub fn mkdirs(stack: &MemoryStack, parts: &[&str]) {
    for depth in 1..=parts.len() {
        let path = dir(&parts[..depth]);
        if stack.lookup(&path).unwrap().is_none() {
            stack.create(&path, FileKind::Directory).unwrap();
        }
    }
}

pub fn protect(engine: &Engine, parts: &[&str], payload: &[u8], key_byte: u8) -> veil_core::EntityId {
    engine
        .add_entity(EntitySpec::directory(dir(parts), payload, key(key_byte)))
        .expect("add entity")
}

/// Raw on-disk bytes of the file at `name`.
pub fn raw(stack: &MemoryStack, path: &NormalizedPath) -> Vec<u8> {
    let info = stack.lookup(path).unwrap().expect("file exists");
    stack.raw_contents(info.id).unwrap()
}

pub async fn open_file(engine: &Engine, name: &str) -> veil_core::HandleId {
    engine.open(OpenRequest::file(name, S1)).await.expect("open")
}
