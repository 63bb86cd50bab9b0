//! In-place conversions of open files: enable, disable, rekey and header
//! replacement.

mod common;

use common::*;
use veil_core::{CfsError, NormalizedPath};
use veil_engine::header::HEADER_MAGIC;
use veil_engine::tail::TAIL_BLOCK_SIZE;
use veil_engine::{Header, CIPHER_CHACHA20, DEEPNESS_UNLIMITED};

const CONTENT: &[u8] = b"quarterly figures, not yet public";

fn template(payload: &[u8], block_size: u32) -> Header {
    Header::new(CIPHER_CHACHA20, block_size, DEEPNESS_UNLIMITED, payload.to_vec()).unwrap()
}

fn path() -> NormalizedPath {
    NormalizedPath::file("c", &["m"], "doc")
}

#[tokio::test]
async fn enable_then_disable_round_trips_content() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["m"]);
    let h = open_file(&engine, "c:/m/doc").await;
    engine.write(h, 0, CONTENT).unwrap();
    protect(&engine, &["m"], b"p", 1);

    let report = engine
        .enable_encryption(h, &template(b"p", 512), &key(1), false)
        .unwrap();
    assert_eq!(report.valid_length, CONTENT.len() as u64);
    assert_eq!(report.future_header_size, 512);
    assert!(engine.is_encrypted(h).unwrap());
    assert!(engine.handle_entity(h).unwrap().is_some(), "bound to the resolving entity");

    let on_disk = raw(&stack, &path());
    assert_eq!(&on_disk[..4], &HEADER_MAGIC.to_le_bytes());
    assert_eq!(on_disk.len() as u64, report.physical_size);
    assert_eq!(engine.read(h, 0, 100).unwrap(), CONTENT);
    engine.close(h).unwrap();

    // The policy now applies on reopen
    let h = open_file(&engine, "c:/m/doc").await;
    assert!(engine.is_encrypted(h).unwrap());
    assert_eq!(engine.read(h, 0, 100).unwrap(), CONTENT);

    let err = engine.disable_encryption(h, &key(2), false).unwrap_err();
    assert!(matches!(err, CfsError::KeyRejected(_)), "{err}");

    engine.disable_encryption(h, &key(1), false).unwrap();
    assert!(!engine.is_encrypted(h).unwrap());
    assert_eq!(engine.handle_entity(h).unwrap(), None);
    assert_eq!(raw(&stack, &path()), CONTENT);
    engine.close(h).unwrap();
}

#[tokio::test]
async fn enabling_twice_is_refused() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["m"]);
    protect(&engine, &["m"], b"p", 1);
    let h = open_file(&engine, "c:/m/doc").await;
    let err = engine
        .enable_encryption(h, &template(b"p", 512), &key(1), false)
        .unwrap_err();
    assert!(matches!(err, CfsError::InvalidRequest(_)), "{err}");
    engine.close(h).unwrap();
}

#[tokio::test]
async fn rekey_switches_the_unlocking_key() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["m"]);
    protect(&engine, &["m"], b"p", 1);
    let h = open_file(&engine, "c:/m/doc").await;
    engine.write(h, 0, CONTENT).unwrap();
    let before = raw(&stack, &path());

    let err = engine.rekey(h, &key(9), &key(2), false).unwrap_err();
    assert!(matches!(err, CfsError::KeyRejected(_)));

    engine.rekey(h, &key(1), &key(2), false).unwrap();
    let after = raw(&stack, &path());
    assert_eq!(before.len(), after.len());
    assert_ne!(before[512..], after[512..], "content re-encrypted under a new file key");
    assert_eq!(engine.read(h, 0, 100).unwrap(), CONTENT);
    // The entity still holds key 1, so the file no longer belongs to it
    assert_eq!(engine.handle_entity(h).unwrap(), None);

    assert!(engine.disable_encryption(h, &key(1), false).is_err());
    engine.disable_encryption(h, &key(2), false).unwrap();
    assert_eq!(raw(&stack, &path()), CONTENT);
    engine.close(h).unwrap();
}

#[tokio::test]
async fn header_can_grow_and_shrink() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["m"]);
    protect(&engine, &["m"], b"p", 1);
    let h = open_file(&engine, "c:/m/doc").await;
    let content: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
    engine.write(h, 0, &content).unwrap();

    let large = template(&[7u8; 600], 1024);
    let report = engine.set_header(h, &large, false).unwrap();
    assert_eq!(report.present_header_size, 512);
    assert_eq!(report.future_header_size, 1024);
    let on_disk = raw(&stack, &path());
    assert_eq!(on_disk.len() as u64, report.physical_size);
    assert_eq!(Header::decode(&on_disk[..1024]).unwrap().payload, vec![7u8; 600]);
    assert_eq!(engine.read(h, 0, 4096).unwrap(), content);
    assert_eq!(engine.get_header(h).unwrap().unwrap().block_size, 1024);

    let report = engine.set_header(h, &template(b"p", 512), false).unwrap();
    assert_eq!(report.future_header_size, 512);
    let on_disk = raw(&stack, &path());
    assert_eq!(on_disk.len(), 512 + 1536 + TAIL_BLOCK_SIZE);
    assert_eq!(engine.read(h, 0, 4096).unwrap(), content);
    // Back on the entity's own policy
    assert!(engine.handle_entity(h).unwrap().is_some());
    engine.close(h).unwrap();

    let h = open_file(&engine, "c:/m/doc").await;
    assert_eq!(engine.read(h, 0, 4096).unwrap(), content);
    engine.close(h).unwrap();
}

#[tokio::test]
async fn migration_materializes_pending_extension() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["m"]);
    protect(&engine, &["m"], b"p", 1);
    let h = open_file(&engine, "c:/m/doc").await;
    engine.write(h, 0, b"ab").unwrap();
    engine.set_size(h, 700).unwrap();

    let report = engine.disable_encryption(h, &key(1), false).unwrap();
    assert_eq!(report.valid_length, 700);
    let on_disk = raw(&stack, &path());
    assert_eq!(on_disk.len(), 700);
    assert_eq!(&on_disk[..2], b"ab");
    assert!(on_disk[2..].iter().all(|b| *b == 0));
    engine.close(h).unwrap();
}
