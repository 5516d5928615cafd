//! End-to-end shard run: in-memory stream and checkpoints, mock HTTP
//! classifier, real filesystem archive and logs.

use axum::extract::Multipart;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use chanscan_pipeline::prelude::*;
use chanscan_pipeline::ReferenceEntry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn serve_classifier() -> String {
    let router = Router::new().route(
        "/classify",
        post(|mut multipart: Multipart| async move {
            while let Ok(Some(field)) = multipart.next_field().await {
                if field.name() == Some("imagefile") {
                    return Ok(Json(serde_json::json!({
                        "name": STANDARD.encode("Channel-X"),
                        "type": "sport",
                        "std_channel_id": "C1",
                        "caffe_scores": "0.98"
                    })));
                }
            }
            Err(StatusCode::BAD_REQUEST)
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/classify")
}

fn config(root: &Path, classifier_url: &str) -> Config {
    serde_json::from_value(serde_json::json!({
        "orchestrator": { "process_num": 1 },
        "kafka": {
            "bootstrap_servers": "localhost:9092",
            "topic": "frames",
            "partition_start": 0,
            "partition_end": 7
        },
        "archive": {
            "site_id": "SITE01",
            "archive_dir": root.join("archive"),
        },
        "classifier": {
            "url": classifier_url,
            "log_dir": root.join("logs"),
            "workers": 1,
            "queue_capacity": 4,
            "work_queue_capacity": 4,
            "request_timeout_secs": 5,
            "flush_every_lines": 1
        },
        "reference": {
            "url": "http://127.0.0.1:9/channels",
            "cache_file": root.join("channels.json")
        },
        "checkpoint": { "heartbeat_interval_secs": 1 }
    }))
    .unwrap()
}

fn reference() -> Arc<ReferenceTable> {
    Arc::new(ReferenceTable::from_entries([ReferenceEntry {
        ch_id: "C1".to_string(),
        name: "Channel-X".to_string(),
        operator: "OpA".to_string(),
        source_type: "IPTV".to_string(),
    }]))
}

fn frame(partition: i32, offset: i64) -> StreamRecord {
    let payload = serde_json::json!({
        "gzid": "GZ01",
        "img_name": format!("frame_{offset}.jpg"),
        "device_id": "STB-7",
        "create_time": "2024-03-02 09:15:00",
        "img_code": STANDARD.encode(b"\xff\xd8jpeg"),
        "province": "P1",
        "city": "C9",
        "isp": "ISP"
    });
    StreamRecord {
        topic: "frames".to_string(),
        partition,
        offset,
        payload: payload.to_string().into_bytes(),
    }
}

fn log_file(root: &Path) -> PathBuf {
    root.join("logs")
        .join("2024-03-02")
        .join(format!("log-{}.0", std::process::id()))
}

fn log_lines(root: &Path) -> Vec<String> {
    std::fs::read_to_string(log_file(root))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}

async fn wait_for_lines(root: &Path, count: usize) {
    for _ in 0..500 {
        if log_lines(root).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} log lines, found {:?}", log_lines(root));
}

/// Run one shard over `records` until `lines` log lines exist, then stop it
async fn run_until_logged(
    config: &Config,
    root: &Path,
    store: &MemoryCheckpointStore,
    records: Vec<StreamRecord>,
    lines: usize,
) {
    let (tx, source) = MemorySource::channel();
    for record in records {
        tx.send(record).unwrap();
    }

    let token = CancellationToken::new();
    let shard = tokio::spawn({
        let config = config.clone();
        let checkpoints: Arc<dyn CheckpointOpener> = Arc::new(store.clone());
        let token = token.clone();
        async move { run_shard(&config, vec![3], source, checkpoints, reference(), token).await }
    });

    wait_for_lines(root, lines).await;
    token.cancel();
    tokio::time::timeout(Duration::from_secs(10), shard)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    drop(tx);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shard_archives_classifies_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve_classifier().await;
    let config = config(dir.path(), &url);
    let store = MemoryCheckpointStore::new();

    run_until_logged(&config, dir.path(), &store, vec![frame(3, 42)], 1).await;

    let image = dir
        .path()
        .join("archive/SITE01/2024-03-02/GZ01_900000_STB-7_2024-03-02/frame_42.jpg");
    assert_eq!(std::fs::read(&image).unwrap(), b"\xff\xd8jpeg");

    let dev_list = image.with_file_name("dev_list.csv");
    assert_eq!(
        std::fs::read_to_string(dev_list).unwrap(),
        "frame_42\tGZ01\tSTB-7\t2024-03-02 09:15:00\tP1\tC9\tISP\n"
    );

    assert_eq!(
        log_lines(dir.path()),
        vec!["frame_42,GZ01,STB-7,2024-03-02 09:15:00,Channel-X,sport,C1,0.98,OpA,IPTV,P1,C9,ISP"]
    );
    assert_eq!(store.get("frames", 3), Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_resumes_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve_classifier().await;
    let config = config(dir.path(), &url);
    let store = MemoryCheckpointStore::new();

    run_until_logged(&config, dir.path(), &store, vec![frame(3, 42)], 1).await;
    assert_eq!(store.get("frames", 3), Some(42));

    // Replay of the partition from an earlier position: only 43 and 44 are new
    let replay = (40..45).map(|offset| frame(3, offset)).collect();
    run_until_logged(&config, dir.path(), &store, replay, 3).await;

    let processed: Vec<String> = log_lines(dir.path())
        .iter()
        .map(|line| line.split(',').next().unwrap().to_string())
        .collect();
    assert_eq!(processed, vec!["frame_42", "frame_43", "frame_44"]);
    assert_eq!(store.get("frames", 3), Some(44));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shard_stops_when_stream_ends() {
    let dir = tempfile::tempdir().unwrap();
    let url = serve_classifier().await;
    let config = config(dir.path(), &url);
    let store = MemoryCheckpointStore::new();

    let (tx, source) = MemorySource::channel();
    tx.send(frame(3, 42)).unwrap();
    drop(tx);

    let token = CancellationToken::new();
    let checkpoints: Arc<dyn CheckpointOpener> = Arc::new(store.clone());
    tokio::time::timeout(
        Duration::from_secs(10),
        run_shard(&config, vec![3], source, checkpoints, reference(), token.clone()),
    )
    .await
    .expect("shard kept running after its stream ended")
    .unwrap();

    assert!(!token.is_cancelled());
    assert_eq!(log_lines(dir.path()).len(), 1);
    assert_eq!(store.get("frames", 3), Some(42));
}
