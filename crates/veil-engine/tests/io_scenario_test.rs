//! End-to-end read/write through the engine over an in-memory stack.

mod common;

use common::*;
use veil_core::NormalizedPath;
use veil_engine::header::{Header, HEADER_MAGIC};
use veil_engine::tail::TAIL_BLOCK_SIZE;
use veil_engine::OpenRequest;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

#[tokio::test]
async fn write_4096_under_directory_policy() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["data"]);
    let path = NormalizedPath::file("c", &["data"], "report.bin");

    // Created before any policy exists
    let h = open_file(&engine, "c:/data/report.bin").await;
    engine.close(h).unwrap();

    protect(&engine, &["data"], b"finance", 1);

    let h = open_file(&engine, "c:/data/report.bin").await;
    assert!(engine.is_encrypted(h).unwrap());
    let data = pattern(4096);
    assert_eq!(engine.write(h, 0, &data).unwrap(), 4096);

    let on_disk = raw(&stack, &path);
    assert_eq!(&on_disk[..4], &HEADER_MAGIC.to_le_bytes());
    let header = Header::decode(&on_disk[..512]).unwrap();
    assert_eq!(header.block_size, 512);
    assert_eq!(header.payload, b"finance");
    assert_eq!(on_disk.len(), 512 + 4096 + TAIL_BLOCK_SIZE);
    assert_ne!(&on_disk[512..512 + 4096], &data[..], "content is stored encrypted");

    assert_eq!(engine.read(h, 0, 4096).unwrap(), data);
    assert_eq!(engine.query_size(h).unwrap().end_of_file, 4096);
    engine.close(h).unwrap();

    // A fresh open rediscovers the length from the tail
    let h = open_file(&engine, "c:/data/report.bin").await;
    assert_eq!(engine.query_size(h).unwrap().end_of_file, 4096);
    assert_eq!(engine.read(h, 0, 8192).unwrap(), data);
    engine.close(h).unwrap();
}

#[tokio::test]
async fn unaligned_io_on_large_sectors() {
    let (stack, engine) = engine();
    stack.set_sector_size("c", 4096);
    mkdirs(&stack, &["d"]);
    protect(&engine, &["d"], b"p", 2);

    let h = open_file(&engine, "c:/d/f").await;
    let first = pattern(1000);
    engine.write(h, 0, &first).unwrap();
    engine.write(h, 777, b"overlap").unwrap();

    let mut expected = first.clone();
    expected[777..784].copy_from_slice(b"overlap");
    assert_eq!(engine.read(h, 0, 2000).unwrap(), expected);
    assert_eq!(engine.read(h, 5, 10).unwrap(), expected[5..15].to_vec());
    assert!(engine.read(h, 1000, 10).unwrap().is_empty());

    let on_disk = raw(&stack, &NormalizedPath::file("c", &["d"], "f"));
    // 1000 bytes of data pad to 1024 before the 512-byte padding block
    assert_eq!(on_disk.len(), 512 + 1024 + TAIL_BLOCK_SIZE);
    engine.close(h).unwrap();
}

#[tokio::test]
async fn extension_reads_zeros_and_materializes_on_close() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["z"]);
    protect(&engine, &["z"], b"p", 3);

    let h = open_file(&engine, "c:/z/sparse").await;
    engine.write(h, 0, b"head").unwrap();
    engine.set_size(h, 3000).unwrap();
    assert_eq!(engine.query_size(h).unwrap().end_of_file, 3000);

    let read = engine.read(h, 0, 3000).unwrap();
    assert_eq!(&read[..4], b"head");
    assert!(read[4..].iter().all(|b| *b == 0));
    engine.close(h).unwrap();

    let h = open_file(&engine, "c:/z/sparse").await;
    let read = engine.read(h, 0, 4000).unwrap();
    assert_eq!(read.len(), 3000);
    assert!(read[4..].iter().all(|b| *b == 0));

    // Shrink then write past the end: the gap reads as zeros
    engine.set_size(h, 2).unwrap();
    engine.write(h, 10, b"x").unwrap();
    assert_eq!(engine.read(h, 0, 100).unwrap(), b"he\0\0\0\0\0\0\0\0x".to_vec());
    engine.close(h).unwrap();
}

#[tokio::test]
async fn plain_files_pass_through() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["open"]);
    let h = open_file(&engine, "c:/open/notes.txt").await;
    assert!(!engine.is_encrypted(h).unwrap());
    engine.write(h, 0, b"hello").unwrap();
    assert_eq!(raw(&stack, &NormalizedPath::file("c", &["open"], "notes.txt")), b"hello");
    assert_eq!(engine.read(h, 1, 3).unwrap(), b"ell");
    engine.close(h).unwrap();
}

#[tokio::test]
async fn listing_reports_logical_sizes() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["data"]);
    protect(&engine, &["data"], b"p", 4);

    let h = open_file(&engine, "c:/data/a").await;
    engine.write(h, 0, &pattern(100)).unwrap();
    engine.close(h).unwrap();
    let h = open_file(&engine, "c:/data/b").await;
    engine.write(h, 0, &pattern(700)).unwrap();

    let entries = engine.list_directory(S1, &dir(&["data"])).unwrap();
    let sizes: Vec<(String, u64)> = entries.iter().map(|e| (e.name.clone(), e.size)).collect();
    assert_eq!(sizes, vec![("a".to_string(), 100), ("b".to_string(), 700)]);
    engine.close(h).unwrap();

    let dh = engine
        .open(OpenRequest::directory("c:/data", S1))
        .await
        .unwrap();
    assert_eq!(engine.list_handle(dh).unwrap().len(), 2);
    engine.close(dh).unwrap();
}

#[tokio::test]
async fn existing_plain_content_is_left_alone() {
    let (stack, engine) = engine();
    mkdirs(&stack, &["legacy"]);
    let h = open_file(&engine, "c:/legacy/old.txt").await;
    engine.write(h, 0, b"written before the policy").unwrap();
    engine.close(h).unwrap();

    protect(&engine, &["legacy"], b"p", 5);
    let h = open_file(&engine, "c:/legacy/old.txt").await;
    assert!(!engine.is_encrypted(h).unwrap());
    assert_eq!(engine.read(h, 0, 100).unwrap(), b"written before the policy");
    engine.close(h).unwrap();
}
