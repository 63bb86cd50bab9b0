//! AutoConfig discovery and propagation, the key broker round trip, and
//! escape re-attachment.

mod common;

use std::sync::Arc;

use common::*;
use veil_core::{CfsError, FileKind, NormalizedPath, StackKind};
use veil_engine::autoconfig::{autoconfig_path, read_autoconfig, write_autoconfig};
use veil_engine::entity::EntityOrigin;
use veil_engine::{CipherManager, Engine, EntitySpec, Header, OpenRequest, RawName, CIPHER_CHACHA20, DEEPNESS_UNLIMITED};
use veil_storage::{MemoryStack, StorageStack};

const AUTOCONFIG: &str = ".veil-autoconfig";

fn plant_autoconfig(stack: &MemoryStack, parts: &[&str], payload: &[u8], deepness: u32) {
    let template = Header::new(CIPHER_CHACHA20, 512, deepness, payload.to_vec()).unwrap();
    let cipher = CipherManager::new(&config().engine);
    write_autoconfig(stack, &cipher, &dir(parts), AUTOCONFIG, &template, deepness).unwrap();
}

/// Answer `count` key requests with `[key_byte; 32]`.
fn spawn_agent(engine: &Arc<Engine>, key_byte: u8, count: usize) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
    let mut agent = engine.connect_key_broker();
    let engine = Arc::clone(engine);
    tokio::spawn(async move {
        let mut payloads = Vec::new();
        for _ in 0..count {
            let Some(request) = agent.next().await else {
                break;
            };
            engine
                .fire_key_response(request.cookie, &[key_byte; 32])
                .unwrap();
            payloads.push(request.payload);
        }
        payloads
    })
}

#[tokio::test]
async fn discovery_asks_the_key_agent_once() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["vault", "inner"]);
    plant_autoconfig(&stack, &["vault"], b"vault policy", DEEPNESS_UNLIMITED);
    let engine = Arc::new(engine);
    let agent = spawn_agent(&engine, 7, 1);

    let h = open_file(&engine, "c:/vault/inner/doc").await;
    assert!(engine.is_encrypted(h).unwrap());
    assert_eq!(agent.await.unwrap(), vec![b"vault policy".to_vec()]);

    let entities = engine.entities();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].path, dir(&["vault"]));
    assert_eq!(entities[0].origin, EntityOrigin::AutoConfig);

    // Already known: no second request (the agent is gone)
    let other = open_file(&engine, "c:/vault/second").await;
    assert!(engine.is_encrypted(other).unwrap());
    engine.close(other).unwrap();
    engine.close(h).unwrap();

    // The policy file never shows up in listings
    let names: Vec<String> = engine
        .list_directory(S1, &dir(&["vault"]))
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["inner".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn known_template_reuses_the_key() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["a"]);
    mkdirs(&stack, &["b"]);
    protect(&engine, &["a"], b"shared", 3);
    plant_autoconfig(&stack, &["b"], b"shared", DEEPNESS_UNLIMITED);

    // No agent connected, yet the open succeeds
    let h = open_file(&engine, "c:/b/f").await;
    assert!(engine.is_encrypted(h).unwrap());
    assert_eq!(engine.entities().len(), 2);
    assert_eq!(engine.header_count(), 1);
    engine.close(h).unwrap();
}

#[tokio::test]
async fn unanswered_key_request_denies_the_open() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["slow"]);
    plant_autoconfig(&stack, &["slow"], b"p", DEEPNESS_UNLIMITED);

    let err = engine.open(OpenRequest::file("c:/slow/f", S1)).await.unwrap_err();
    assert!(matches!(err, CfsError::KeyBrokerUnavailable), "{err}");

    let _agent = engine.connect_key_broker();
    let err = engine.open(OpenRequest::file("c:/slow/f", S1)).await.unwrap_err();
    assert!(matches!(err, CfsError::PolicyTimeout { timeout_ms: 200 }), "{err}");
    assert!(engine.entities().is_empty());
}

#[tokio::test]
async fn new_directories_inherit_the_policy() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["proj"]);
    engine
        .add_entity(EntitySpec::directory(dir(&["proj"]), b"p".to_vec(), key(1)).persisted())
        .unwrap();
    assert!(stack.lookup(&autoconfig_path(&dir(&["proj"]), AUTOCONFIG)).unwrap().is_some());

    let d = engine
        .open(OpenRequest::directory("c:/proj/sub", S1))
        .await
        .unwrap();
    engine.close(d).unwrap();
    assert!(stack
        .lookup(&autoconfig_path(&dir(&["proj", "sub"]), AUTOCONFIG))
        .unwrap()
        .is_some());
    // The discovered child folds into the parent entity
    assert_eq!(engine.entities().len(), 1);

    // Deleting the directory takes the hidden file with it
    engine
        .delete(RawName::Absolute("c:/proj/sub"), StackKind::Local, FileKind::Directory)
        .unwrap();
    assert!(stack.lookup(&dir(&["proj", "sub"])).unwrap().is_none());
}

#[tokio::test]
async fn refused_directory_delete_keeps_the_policy() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["vault"]);
    plant_autoconfig(&stack, &["vault"], b"vault policy", DEEPNESS_UNLIMITED);
    let engine = Arc::new(engine);
    let agent = spawn_agent(&engine, 5, 1);

    let h = open_file(&engine, "c:/vault/doc").await;
    engine.write(h, 0, b"secret").unwrap();
    agent.await.unwrap();

    let err = engine
        .delete(RawName::Absolute("c:/vault"), StackKind::Local, FileKind::Directory)
        .unwrap_err();
    assert!(matches!(err, CfsError::InvalidRequest(_)), "{err}");

    // Policy file, entity and the open handle all survive
    assert!(stack.lookup(&autoconfig_path(&dir(&["vault"]), AUTOCONFIG)).unwrap().is_some());
    assert_eq!(engine.entities().len(), 1);
    assert_eq!(engine.read(h, 0, 6).unwrap(), b"secret");
    let fresh = open_file(&engine, "c:/vault/new").await;
    assert!(engine.is_encrypted(fresh).unwrap());
    engine.close(fresh).unwrap();
    engine.close(h).unwrap();

    for name in ["c:/vault/doc", "c:/vault/new"] {
        engine
            .delete(RawName::Absolute(name), StackKind::Local, FileKind::File)
            .unwrap();
    }
    engine
        .delete(RawName::Absolute("c:/vault"), StackKind::Local, FileKind::Directory)
        .unwrap();
    assert!(stack.lookup(&dir(&["vault"])).unwrap().is_none());
    assert!(engine.entities().is_empty());
}

#[tokio::test]
async fn failed_directory_removal_restores_the_policy_file() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["locked"]);
    plant_autoconfig(&stack, &["locked"], b"p", 3);
    protect(&engine, &["locked"], b"p", 1);
    stack.fail_directory_removals(true);

    let err = engine
        .delete(RawName::Absolute("c:/locked"), StackKind::Local, FileKind::Directory)
        .unwrap_err();
    stack.fail_directory_removals(false);
    assert!(matches!(err, CfsError::Storage(_)), "{err}");
    assert!(stack.lookup(&dir(&["locked"])).unwrap().is_some());

    // The hidden file is back with its deepness; the explicit entity stays
    let cipher = CipherManager::new(&config().engine);
    let restored = read_autoconfig(stack.as_ref(), &cipher, &dir(&["locked"]), AUTOCONFIG)
        .unwrap()
        .unwrap();
    assert_eq!(restored.payload, b"p");
    assert_eq!(restored.deepness, 3);
    assert_eq!(engine.entities().len(), 1);
}

#[tokio::test]
async fn propagation_respects_deepness() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["lim"]);
    engine
        .add_entity(
            EntitySpec::directory(dir(&["lim"]), b"p".to_vec(), key(1))
                .with_deepness(1)
                .persisted(),
        )
        .unwrap();

    let a = engine.open(OpenRequest::directory("c:/lim/a", S1)).await.unwrap();
    let b = engine.open(OpenRequest::directory("c:/lim/a/b", S1)).await.unwrap();
    engine.close(a).unwrap();
    engine.close(b).unwrap();

    let cipher = CipherManager::new(&config().engine);
    let written = veil_engine::autoconfig::read_autoconfig(&*stack, &cipher, &dir(&["lim", "a"]), AUTOCONFIG)
        .unwrap()
        .unwrap();
    assert_eq!(written.deepness, 0);
    assert!(stack
        .lookup(&autoconfig_path(&dir(&["lim", "a", "b"]), AUTOCONFIG))
        .unwrap()
        .is_none());

    let covered = open_file(&engine, "c:/lim/a/f").await;
    let beyond = open_file(&engine, "c:/lim/a/b/f").await;
    assert!(engine.is_encrypted(covered).unwrap());
    assert!(!engine.is_encrypted(beyond).unwrap());
}

#[tokio::test]
async fn negative_cache_skips_rescans() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["plain"]);
    let h = open_file(&engine, "c:/plain/a").await;
    engine.close(h).unwrap();

    // Planted behind the engine's back while the miss is cached
    plant_autoconfig(&stack, &["plain"], b"p", DEEPNESS_UNLIMITED);
    let h = open_file(&engine, "c:/plain/b").await;
    assert!(!engine.is_encrypted(h).unwrap());
    engine.close(h).unwrap();
}

#[tokio::test]
async fn copy_out_of_a_tracked_tree_stays_encrypted() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["secure"]);
    mkdirs(&stack, &["public"]);
    protect(&engine, &["secure"], b"p", 1);

    let src = open_file(&engine, "c:/secure/report.xls").await;
    engine.write(src, 0, b"numbers").unwrap();
    let copy = open_file(&engine, "c:/public/report.xls").await;
    assert!(engine.is_encrypted(copy).unwrap());
    engine.close(copy).unwrap();
    engine.close(src).unwrap();

    let escaped = engine
        .entities()
        .into_iter()
        .find(|e| e.origin == EntityOrigin::Escape)
        .unwrap();
    assert_eq!(escaped.path, NormalizedPath::file("c", &["public"], "report.xls"));

    // Another session's copy is not tracked
    let theirs = engine
        .open(OpenRequest::file("c:/public/other/report.xls", S2))
        .await;
    assert!(theirs.is_err(), "parent directory does not exist");
    mkdirs(&stack, &["public", "other"]);
    let theirs = engine
        .open(OpenRequest::file("c:/public/other/report.xls", S2))
        .await
        .unwrap();
    assert!(!engine.is_encrypted(theirs).unwrap());
    engine.close(theirs).unwrap();
}

#[tokio::test]
async fn renamed_file_keeps_its_policy() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["secure"]);
    mkdirs(&stack, &["public"]);
    protect(&engine, &["secure"], b"p", 1);

    let h = open_file(&engine, "c:/secure/a").await;
    engine.write(h, 0, b"moved data").unwrap();
    engine.close(h).unwrap();

    engine
        .rename(
            S1,
            RawName::Absolute("c:/secure/a"),
            RawName::Absolute("c:/public/a"),
            StackKind::Local,
            FileKind::File,
        )
        .unwrap();

    let h = open_file(&engine, "c:/public/a").await;
    assert!(engine.is_encrypted(h).unwrap());
    assert_eq!(engine.read(h, 0, 100).unwrap(), b"moved data");
    engine.close(h).unwrap();
}

#[tokio::test]
async fn discovered_entities_move_with_their_directory() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["auto"]);
    mkdirs(&stack, &["explicit"]);
    protect(&engine, &["explicit"], b"p", 1);
    plant_autoconfig(&stack, &["auto"], b"p", DEEPNESS_UNLIMITED);
    let h = open_file(&engine, "c:/auto/f").await;
    engine.close(h).unwrap();

    engine
        .rename(
            S1,
            RawName::Absolute("c:/auto"),
            RawName::Absolute("c:/moved"),
            StackKind::Local,
            FileKind::Directory,
        )
        .unwrap();
    let paths: Vec<NormalizedPath> = engine.entities().into_iter().map(|e| e.path).collect();
    assert!(paths.contains(&dir(&["moved"])));
    assert!(!paths.contains(&dir(&["auto"])));

    let h = open_file(&engine, "c:/moved/f").await;
    assert!(engine.is_encrypted(h).unwrap());
    engine.close(h).unwrap();
}
