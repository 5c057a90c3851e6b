//! File Backend Integration Tests
//!
//! Exercise the data/index file pair end to end: writes, seeks, paging,
//! corruption handling and recovery after a crash between the data and index
//! appends.

use bytes::BytesMut;
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use streamlog_core::{Payload, Properties, Record, SeekPosition, StreamInfo};
use streamlog_storage::file::index::{decode_entries, ENTRY_SIZE};
use streamlog_storage::file::{DATA_FILE, INDEX_FILE};
use streamlog_storage::{FileConfig, FileProvider, IteratorHandler, StorageError, StorageProvider};
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create an initialized provider over a temp dir
async fn create_test_provider(dir: &Path, page_size: usize) -> Arc<FileProvider> {
    let provider = Arc::new(FileProvider::new(FileConfig {
        data_dir: dir.to_path_buf(),
        page_size,
        sync_on_write: false,
    }));
    provider.init().await.unwrap();
    provider.load_catalog().await.unwrap();
    provider
}

fn make_records(ids: std::ops::RangeInclusive<u64>, start: DateTime<Utc>) -> Vec<Record> {
    ids.map(|id| {
        Record::new(
            id,
            start + Duration::milliseconds(id as i64 * 10),
            Payload::from_json(&format!(r#"{{"n":{},"tag":"t{}"}}"#, id, id % 3)).unwrap(),
        )
    })
    .collect()
}

/// Helper to create a stream holding records 1..=n
async fn create_stream_with(provider: &FileProvider, n: u64, start: DateTime<Utc>) -> Uuid {
    let uuid = provider.new_stream_id().await.unwrap();
    provider
        .on_create_stream(&StreamInfo::new(uuid, Properties::new()))
        .await
        .unwrap();

    let mut writer = provider.new_writer(uuid).await.unwrap();
    writer.init().await.unwrap();
    writer.open().await.unwrap();
    let records = make_records(1..=n, start);
    for chunk in records.chunks(64) {
        writer.write(chunk).await.unwrap();
    }
    writer.close().await.unwrap();
    uuid
}

async fn open_handler(
    provider: &FileProvider,
    stream: Uuid,
    position: SeekPosition,
) -> Box<dyn IteratorHandler> {
    let mut handler = provider
        .new_iterator_handler(stream, Uuid::new_v4())
        .await
        .unwrap();
    handler.open().await.unwrap();
    handler.seek(&position).await.unwrap();
    handler
}

async fn read_ids(handler: &mut Box<dyn IteratorHandler>, max: usize) -> Vec<u64> {
    let mut ids = Vec::new();
    while ids.len() < max {
        match handler.get_next().await.unwrap() {
            Some(record) => ids.push(record.id),
            None => break,
        }
    }
    ids
}

#[tokio::test]
async fn test_index_matches_data_after_writes() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 100).await;
    let uuid = create_stream_with(&provider, 150, Utc::now()).await;

    let stream_dir = provider.stream_dir(uuid);
    let data = std::fs::read(stream_dir.join(DATA_FILE)).unwrap();
    let index = std::fs::read(stream_dir.join(INDEX_FILE)).unwrap();
    let entries = decode_entries(&index).unwrap();

    assert_eq!(index.len() as u64, 150 * ENTRY_SIZE);
    assert_eq!(entries.len(), 150);
    for pair in entries.windows(2) {
        assert_eq!(pair[0].end_offset(), pair[1].offset);
        assert!(pair[0].id < pair[1].id);
        assert!(pair[0].timestamp_nanos <= pair[1].timestamp_nanos);
    }
    let total: u64 = entries.iter().map(|e| e.length).sum();
    assert_eq!(total, data.len() as u64);

    let info = provider.get_stream_info(uuid).await.unwrap();
    assert_eq!(info.readable.count, 150);
    assert_eq!(info.readable.size_bytes, data.len() as u64);
    assert_eq!(info.readable.first_id, 1);
    assert_eq!(info.readable.last_id, 150);
}

#[tokio::test]
async fn test_seek_policies() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 7).await;
    let start = Utc::now();
    let uuid = create_stream_with(&provider, 50, start).await;

    let mut h = open_handler(&provider, uuid, SeekPosition::First).await;
    assert_eq!(read_ids(&mut h, 3).await, vec![1, 2, 3]);

    let mut h = open_handler(&provider, uuid, SeekPosition::Last).await;
    assert_eq!(read_ids(&mut h, 3).await, vec![50]);

    let mut h = open_handler(&provider, uuid, SeekPosition::AfterLast).await;
    assert!(read_ids(&mut h, 3).await.is_empty());

    let mut h = open_handler(&provider, uuid, SeekPosition::AtId(20)).await;
    assert_eq!(read_ids(&mut h, 3).await, vec![20, 21, 22]);

    let mut h = open_handler(&provider, uuid, SeekPosition::AfterId(20)).await;
    assert_eq!(read_ids(&mut h, 3).await, vec![21, 22, 23]);

    let mut h = open_handler(&provider, uuid, SeekPosition::AfterId(0)).await;
    assert_eq!(read_ids(&mut h, 1).await, vec![1]);

    // record 30 was stamped at start + 300ms; halfway between 29 and 30 lands on 30
    let t = start + Duration::milliseconds(295);
    let mut h = open_handler(&provider, uuid, SeekPosition::AtTimestamp(t)).await;
    assert_eq!(read_ids(&mut h, 2).await, vec![30, 31]);
}

#[tokio::test]
async fn test_seek_failures() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 10).await;
    let start = Utc::now();
    let uuid = create_stream_with(&provider, 10, start).await;

    let mut handler = provider
        .new_iterator_handler(uuid, Uuid::new_v4())
        .await
        .unwrap();
    handler.open().await.unwrap();

    let err = handler.seek(&SeekPosition::AtId(11)).await.unwrap_err();
    assert!(matches!(err, StorageError::RecordNotFound(_)));

    let err = handler.seek(&SeekPosition::AfterId(11)).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidSeek(_)));

    let late = start + Duration::seconds(60);
    let err = handler
        .seek(&SeekPosition::AtTimestamp(late))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::RecordNotFound(_)));
}

#[tokio::test]
async fn test_iterator_sees_later_appends() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 4).await;
    let start = Utc::now();
    let uuid = create_stream_with(&provider, 5, start).await;

    let mut handler = open_handler(&provider, uuid, SeekPosition::AfterLast).await;
    assert!(read_ids(&mut handler, 10).await.is_empty());

    let mut writer = provider.new_writer(uuid).await.unwrap();
    writer.open().await.unwrap();
    writer.write(&make_records(6..=8, start)).await.unwrap();

    assert_eq!(read_ids(&mut handler, 10).await, vec![6, 7, 8]);
}

#[tokio::test]
async fn test_save_seek_restores_position() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 3).await;
    let uuid = create_stream_with(&provider, 20, Utc::now()).await;

    let mut handler = open_handler(&provider, uuid, SeekPosition::First).await;
    assert_eq!(read_ids(&mut handler, 5).await, vec![1, 2, 3, 4, 5]);
    handler.save_seek().await.unwrap();

    handler.seek(&SeekPosition::First).await.unwrap();
    assert_eq!(read_ids(&mut handler, 2).await, vec![6, 7]);
}

#[tokio::test]
async fn test_corrupted_record_is_skippable() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 100).await;
    let uuid = create_stream_with(&provider, 8, Utc::now()).await;

    // Damage record 5 without changing its length
    let data_path = provider.stream_dir(uuid).join(DATA_FILE);
    let text = std::fs::read_to_string(&data_path).unwrap();
    let damaged = text.replacen(r#"{"n":5,"#, r#"["n":5,"#, 1);
    assert_ne!(text, damaged);
    std::fs::write(&data_path, damaged).unwrap();

    let mut handler = open_handler(&provider, uuid, SeekPosition::First).await;
    let mut ids = Vec::new();
    let mut errors = 0;
    loop {
        match handler.get_next().await {
            Ok(Some(record)) => ids.push(record.id),
            Ok(None) => break,
            Err(e) => {
                assert!(e.is_recoverable());
                assert!(matches!(e, StorageError::CorruptedRecord { id: 5, .. }));
                errors += 1;
            }
        }
    }
    assert_eq!(ids, vec![1, 2, 3, 4, 6, 7, 8]);
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn test_recovery_after_crash_before_index_append() {
    let dir = TempDir::new().unwrap();
    let start = Utc::now();
    let uuid = {
        let provider = create_test_provider(dir.path(), 100).await;
        let uuid = create_stream_with(&provider, 600, start).await;
        provider.stop().await.unwrap();
        uuid
    };

    // Simulate a crash after 400 more data lines hit disk but before their
    // index entries did.
    let stream_dir = dir.path().join("streams").join(uuid.to_string());
    let mut data = std::fs::read(stream_dir.join(DATA_FILE)).unwrap();
    for record in make_records(601..=1000, start) {
        data.extend(record.encode_line().unwrap());
    }
    std::fs::write(stream_dir.join(DATA_FILE), &data).unwrap();

    let provider = create_test_provider(dir.path(), 100).await;
    let info = provider.get_stream_info(uuid).await.unwrap();
    assert_eq!(info.readable.count, 1000);
    assert_eq!(info.readable.last_id, 1000);

    let index = std::fs::read(stream_dir.join(INDEX_FILE)).unwrap();
    assert_eq!(index.len() as u64, 1000 * ENTRY_SIZE);

    let mut handler = open_handler(&provider, uuid, SeekPosition::AtId(500)).await;
    assert_eq!(read_ids(&mut handler, 1).await, vec![500]);
}

#[tokio::test]
async fn test_build_index_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let provider = create_test_provider(dir.path(), 100).await;
    let uuid = create_stream_with(&provider, 300, Utc::now()).await;
    let index_path = provider.stream_dir(uuid).join(INDEX_FILE);
    let written = std::fs::read(&index_path).unwrap();

    let first = provider.build_index(uuid).await.unwrap();
    let after_first = std::fs::read(&index_path).unwrap();
    let second = provider.build_index(uuid).await.unwrap();
    let after_second = std::fs::read(&index_path).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.count, 300);
    assert_eq!(after_first, after_second);
    assert_eq!(written, after_first);
}

#[tokio::test]
async fn test_catalog_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut props = Properties::new();
    props.insert("env".to_string(), "prod".to_string());

    let uuid = {
        let provider = create_test_provider(dir.path(), 100).await;
        let uuid = provider.new_stream_id().await.unwrap();
        provider
            .on_create_stream(&StreamInfo::new(uuid, props.clone()))
            .await
            .unwrap();
        provider.stop().await.unwrap();
        uuid
    };

    let provider = create_test_provider(dir.path(), 100).await;
    assert!(provider.stream_exists(uuid).await);
    let info = provider.get_stream_info(uuid).await.unwrap();
    assert_eq!(info.properties, props);
    assert!(info.readable.is_empty());
}

#[tokio::test]
async fn test_torn_index_tail_is_repaired_on_load() {
    let dir = TempDir::new().unwrap();
    let uuid = {
        let provider = create_test_provider(dir.path(), 100).await;
        create_stream_with(&provider, 10, Utc::now()).await
    };

    let index_path = dir
        .path()
        .join("streams")
        .join(uuid.to_string())
        .join(INDEX_FILE);
    let mut index = BytesMut::from(&std::fs::read(&index_path).unwrap()[..]);
    index.extend_from_slice(&[0u8; 5]);
    std::fs::write(&index_path, &index).unwrap();

    let provider = create_test_provider(dir.path(), 100).await;
    assert_eq!(provider.get_stream_info(uuid).await.unwrap().readable.count, 10);
    assert_eq!(std::fs::read(&index_path).unwrap().len() as u64, 10 * ENTRY_SIZE);
}
