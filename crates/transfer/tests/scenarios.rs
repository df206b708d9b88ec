//! End-to-end transfer scenarios against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use s3tool_transfer::memory::{StoreCall, StoreOp};
use s3tool_transfer::{
    DownloadEngine, DownloadOptions, EngineConfig, EventSink, MemoryStore, ObjectStore,
    RetryPolicy, StoreError, TaskControl, TransferEvent, TransferManager, TransferStatus,
    TransferTask, UploadEngine,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

const MIB: u64 = 1024 * 1024;

fn config() -> EngineConfig {
    EngineConfig {
        part_size_bytes: 10 * MIB,
        multipart_threshold_bytes: 5 * MIB,
        retry_policy: RetryPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn as_store(store: &Arc<MemoryStore>) -> Arc<dyn ObjectStore> {
    store.clone()
}

fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn large_file_goes_multipart_in_order() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("video.bin");
    let data = pattern(25 * MIB);
    std::fs::write(&src, &data).unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = UploadEngine::new(as_store(&store), config()).unwrap();
    let mut task = TransferTask::upload("media/video.bin", &src);
    let status = engine
        .start(&mut task, &TaskControl::new(), &EventSink::detached())
        .await
        .unwrap();

    assert_eq!(status, TransferStatus::Completed);
    assert_eq!(task.transferred_bytes, 25 * MIB);
    assert_eq!(store.count(StoreOp::Put), 0);

    let completes: Vec<_> = store
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            StoreCall::Complete { parts, .. } => Some(parts),
            _ => None,
        })
        .collect();
    assert_eq!(completes.len(), 1);
    let numbers: Vec<u32> = completes[0].iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(store.object("media/video.bin").unwrap(), data);
}

#[tokio::test]
async fn small_file_is_a_single_put() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("doc.bin");
    std::fs::write(&src, pattern(4 * MIB)).unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = UploadEngine::new(as_store(&store), config()).unwrap();
    let mut task = TransferTask::upload("doc.bin", &src);
    engine
        .start(&mut task, &TaskControl::new(), &EventSink::detached())
        .await
        .unwrap();

    assert_eq!(store.count(StoreOp::Put), 1);
    assert_eq!(store.count(StoreOp::CreateMultipart), 0);
    assert_eq!(store.count(StoreOp::UploadPart), 0);
}

#[tokio::test]
async fn interrupted_download_reopens_at_written_offset() {
    let dir = TempDir::new().unwrap();
    let data = pattern(10 * MIB);
    let store = Arc::new(MemoryStore::new());
    store.insert_object("backup.tar", data.clone());
    store.fail_stream_after(3 * MIB, StoreError::ConnectionReset("peer closed".into()));

    let engine = DownloadEngine::new(as_store(&store), config()).unwrap();
    let dest = dir.path().join("backup.tar");
    let mut task = TransferTask::download("backup.tar", &dest);
    let status = engine
        .start(
            &mut task,
            DownloadOptions::default(),
            &TaskControl::new(),
            &EventSink::detached(),
        )
        .await
        .unwrap();

    assert_eq!(status, TransferStatus::Completed);
    assert_eq!(store.range_starts(), vec![0, 3 * MIB]);
    assert_eq!(task.retry_count, 1);

    let written = std::fs::read(&dest).unwrap();
    assert_eq!(written.len() as u64, 10 * MIB);
    assert_eq!(written, data);
}

#[tokio::test]
async fn upload_resume_sends_only_missing_parts() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("big.bin");
    let data = pattern(25 * MIB);
    std::fs::write(&src, &data).unwrap();

    let store = Arc::new(MemoryStore::new());
    let p1 = data[..(10 * MIB) as usize].to_vec();
    let p2 = data[(10 * MIB) as usize..(20 * MIB) as usize].to_vec();
    let upload_id = store.seed_upload("big.bin", &[(1, p1), (2, p2)]);

    let engine = UploadEngine::new(as_store(&store), config()).unwrap();
    let mut task = TransferTask::upload("big.bin", &src);
    task.total_bytes = 25 * MIB;
    task.transition(TransferStatus::Active).unwrap();
    task.transition(TransferStatus::Paused).unwrap();

    let status = engine
        .resume(&mut task, &upload_id, &TaskControl::new(), &EventSink::detached())
        .await
        .unwrap();

    assert_eq!(status, TransferStatus::Completed);
    assert_eq!(store.uploaded_part_numbers(), vec![3]);
    assert_eq!(store.object("big.bin").unwrap(), data);
    assert_eq!(store.pending_uploads(), 0);
}

#[tokio::test]
async fn download_resume_requests_from_partial_size() {
    let dir = TempDir::new().unwrap();
    let data = pattern(2 * MIB);
    let store = Arc::new(MemoryStore::new());
    store.insert_object("photos.zip", data.clone());

    let dest = dir.path().join("photos.zip");
    let partial = 700_000usize;
    std::fs::write(&dest, &data[..partial]).unwrap();

    let engine = DownloadEngine::new(as_store(&store), config()).unwrap();
    let mut task = TransferTask::download("photos.zip", &dest);
    task.transition(TransferStatus::Active).unwrap();
    task.transition(TransferStatus::Paused).unwrap();

    let (tx, mut rx) = mpsc::channel(1024);
    engine
        .resume(&mut task, &TaskControl::new(), &EventSink::new(tx))
        .await
        .unwrap();

    assert_eq!(store.range_starts(), vec![partial as u64]);
    assert_eq!(std::fs::read(&dest).unwrap(), data);

    let mut last_transferred = 0;
    while let Ok(event) = rx.try_recv() {
        if let TransferEvent::Progress { transferred, .. } = event {
            assert!(transferred >= partial as u64);
            assert!(transferred >= last_transferred);
            last_transferred = transferred;
        }
    }
    assert_eq!(last_transferred, 2 * MIB);
}

#[tokio::test]
async fn manager_runs_concurrent_tasks() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let config = EngineConfig {
        part_size_bytes: 64 * 1024,
        multipart_threshold_bytes: 64 * 1024,
        ..config()
    };
    let mut mgr = TransferManager::new(as_store(&store), config).unwrap();
    let mut events = mgr.take_events().unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let src = dir.path().join(format!("file-{i}.bin"));
        std::fs::write(&src, pattern(200_000 + i * 1000)).unwrap();
        ids.push(mgr.start_upload(mgr.upload_task(format!("up/{i}"), &src)).unwrap());
    }
    for id in &ids {
        let task = mgr.wait(id).await.unwrap();
        assert_eq!(task.status(), TransferStatus::Completed);
    }
    assert!(store.peak_parts_in_flight() <= 3);

    for i in 0..5u64 {
        assert_eq!(
            store.object(&format!("up/{i}")).unwrap(),
            pattern(200_000 + i * 1000)
        );
    }

    drop(mgr);
    let mut completed = 0;
    while let Some(event) = events.recv().await {
        if matches!(event, TransferEvent::Completed { .. }) {
            completed += 1;
        }
    }
    assert_eq!(completed, 5);
}

#[tokio::test]
async fn exhausted_network_retries_fail_the_task() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("f.bin");
    std::fs::write(&src, pattern(1000)).unwrap();

    let store = Arc::new(MemoryStore::new());
    store.fail_times(StoreOp::Put, 10, StoreError::Timeout);
    let engine = UploadEngine::new(as_store(&store), config()).unwrap();

    let mut task = TransferTask::upload("f.bin", &src);
    let err = engine
        .start(&mut task, &TaskControl::new(), &EventSink::detached())
        .await
        .unwrap_err();

    assert!(matches!(err, s3tool_transfer::TransferError::Store(StoreError::Timeout)));
    assert_eq!(task.status(), TransferStatus::Failed);
    assert_eq!(store.count(StoreOp::Put), 3);
    let classified = task.error.unwrap();
    assert!(classified.retryable());
    assert!(!classified.suggestions().is_empty());
}
