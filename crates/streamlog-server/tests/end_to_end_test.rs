//! End-to-End Scenarios
//!
//! Create / append / read through the full service stack. Every scenario
//! runs against the file, relational (SQLite file) and in-memory backends,
//! except crash recovery, which is specific to the file layout.

use std::path::Path;
use std::time::Duration;
use streamlog_core::{IteratorRequest, Payload, Properties};
use streamlog_server::{ServiceConfig, StreamService};
use streamlog_storage::{ProviderRegistry, StorageType};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BACKENDS: [StorageType; 3] = [
    StorageType::File,
    StorageType::Relational,
    StorageType::InMemory,
];

fn config_for(storage_type: StorageType, dir: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.storage.storage_type = storage_type;
    config.storage.file.data_dir = dir.join("data");
    config.storage.relational.dsn = dir.join("streams.db").display().to_string();
    config.streams.bulk_flush_frequency = 0.0;
    config
}

async fn start_service(config: ServiceConfig) -> StreamService {
    let service = StreamService::from_registry(config, &ProviderRegistry::with_defaults()).unwrap();
    service.init().await.unwrap();
    service
}

fn json(body: &str) -> Payload {
    Payload::from_json(body).unwrap()
}

async fn put_all(service: &StreamService, stream: Uuid, n: u64) -> u64 {
    let payloads = (1..=n)
        .map(|i| json(&format!(r#"{{"seq":{}}}"#, i)))
        .collect();
    let ids = service.put_batch(stream, payloads).await.unwrap();
    let last = *ids.last().unwrap();
    service
        .wait_readable(stream, last, Duration::from_secs(10))
        .await
        .unwrap();
    last
}

async fn read_ids(
    service: &StreamService,
    stream: Uuid,
    request: IteratorRequest,
    max: usize,
) -> Vec<u64> {
    let iterator = service.create_iterator(stream, request).await.unwrap();
    let page = service
        .get_records(stream, iterator, &CancellationToken::new(), max)
        .await
        .unwrap();
    service.close_iterator(stream, iterator).await.unwrap();
    page.records.iter().map(|r| r.id).collect()
}

#[tokio::test]
async fn test_create_append_read_back() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let service = start_service(config_for(backend, dir.path())).await;
        let stream = service.create_stream(Properties::new()).await.unwrap().uuid();

        let mut last = 0;
        for body in [r#"{"k":1}"#, r#"{"k":2}"#, r#"{"k":3}"#] {
            last = service.put(stream, json(body)).await.unwrap();
        }
        service
            .wait_readable(stream, last, Duration::from_secs(10))
            .await
            .unwrap();

        let iterator = service
            .create_iterator(stream, IteratorRequest::first())
            .await
            .unwrap();
        let page = service
            .get_records(stream, iterator, &CancellationToken::new(), 10)
            .await
            .unwrap();

        assert_eq!(page.count, 3, "backend {}", backend);
        assert!(!page.remain);
        let ids: Vec<u64> = page.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        let ks: Vec<serde_json::Value> = page
            .records
            .iter()
            .map(|r| r.payload.to_value().unwrap()["k"].clone())
            .collect();
        assert_eq!(ks, vec![1, 2, 3]);

        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_paging() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let service = start_service(config_for(backend, dir.path())).await;
        let stream = service.create_stream(Properties::new()).await.unwrap().uuid();
        put_all(&service, stream, 250).await;

        let iterator = service
            .create_iterator(stream, IteratorRequest::first())
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        let mut pages = Vec::new();
        for _ in 0..3 {
            let page = service
                .get_records(stream, iterator, &cancel, 100)
                .await
                .unwrap();
            pages.push((page.count, page.remain, page.last_id_read));
        }
        assert_eq!(
            pages,
            vec![(100, true, 100), (100, true, 200), (50, false, 250)],
            "backend {}",
            backend
        );

        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_positional_seek() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let service = start_service(config_for(backend, dir.path())).await;
        let stream = service.create_stream(Properties::new()).await.unwrap().uuid();
        put_all(&service, stream, 250).await;

        assert_eq!(
            read_ids(&service, stream, IteratorRequest::at_id(100), 5).await,
            vec![100, 101, 102, 103, 104],
            "backend {}",
            backend
        );
        assert_eq!(
            read_ids(&service, stream, IteratorRequest::after_id(100), 5).await,
            vec![101, 102, 103, 104, 105]
        );
        assert_eq!(read_ids(&service, stream, IteratorRequest::last(), 5).await, vec![250]);
        assert!(read_ids(&service, stream, IteratorRequest::after_last(), 5)
            .await
            .is_empty());

        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_temporal_seek() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let service = start_service(config_for(backend, dir.path())).await;
        let stream = service.create_stream(Properties::new()).await.unwrap().uuid();

        for i in 1..=3 {
            let id = service.put(stream, json(&format!("{}", i))).await.unwrap();
            service
                .wait_readable(stream, id, Duration::from_secs(10))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let iterator = service
            .create_iterator(stream, IteratorRequest::first())
            .await
            .unwrap();
        let all = service
            .get_records(stream, iterator, &CancellationToken::new(), 10)
            .await
            .unwrap();
        let t2 = all.records[1].creation_time;
        assert!(all.records[0].creation_time < t2);
        assert!(t2 < all.records[2].creation_time);

        let ids = read_ids(&service, stream, IteratorRequest::at_timestamp(t2), 10).await;
        assert_eq!(ids, vec![2, 3], "backend {}", backend);

        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_filter() {
    for backend in BACKENDS {
        let dir = TempDir::new().unwrap();
        let service = start_service(config_for(backend, dir.path())).await;
        let stream = service.create_stream(Properties::new()).await.unwrap().uuid();

        let payloads = [
            r#"{"level":"info"}"#,
            r#"{"level":"warn"}"#,
            r#"{"level":"error"}"#,
            r#"{"level":"warn"}"#,
        ]
        .into_iter()
        .map(json)
        .collect();
        let ids = service.put_batch(stream, payloads).await.unwrap();
        service
            .wait_readable(stream, ids[3], Duration::from_secs(10))
            .await
            .unwrap();

        let iterator = service
            .create_iterator(
                stream,
                IteratorRequest::first().with_filter(r#".level == "warn""#),
            )
            .await
            .unwrap();
        let page = service
            .get_records(stream, iterator, &CancellationToken::new(), 10)
            .await
            .unwrap();

        assert_eq!(page.count, 2, "backend {}", backend);
        assert_eq!(page.skipped, 2);
        assert_eq!(page.errors, 0);
        assert!(page
            .records
            .iter()
            .all(|r| r.payload.to_value().unwrap()["level"] == "warn"));

        service.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_crash_before_index_append_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(StorageType::File, dir.path());
    config.streams.bulk_flush_frequency = 0.05;
    config.streams.bulk_max_size = 128;

    let stream = {
        let service = start_service(config.clone()).await;
        let stream = service.create_stream(Properties::new()).await.unwrap().uuid();
        assert_eq!(put_all(&service, stream, 1000).await, 1000);
        service.stop().await.unwrap();
        stream
    };

    // Lose the index entries of the last 400 records, as if the process died
    // between the data append and the index append.
    let index = dir
        .path()
        .join("data")
        .join("streams")
        .join(stream.to_string())
        .join("index.bin");
    let file = std::fs::OpenOptions::new().write(true).open(&index).unwrap();
    file.set_len(600 * 32).unwrap();
    drop(file);

    let service = start_service(config).await;
    let stats = service.rebuild_index(stream).await.unwrap();
    assert_eq!(stats.count, 1000);
    assert_eq!(stats.last_id, 1000);
    assert_eq!(std::fs::metadata(&index).unwrap().len(), 1000 * 32);

    assert_eq!(
        read_ids(&service, stream, IteratorRequest::at_id(500), 1).await,
        vec![500]
    );

    // Appends continue after the recovered tail
    let id = service.put(stream, json("{}")).await.unwrap();
    assert_eq!(id, 1001);
    service.stop().await.unwrap();
}
