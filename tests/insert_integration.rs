//! End-to-end inserts against on-disk stores

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use splitfile_insert::segment::SegmentContext;
use splitfile_insert::{
    BlockKey, CHK_BLOCK_SIZE, ClientMetadata, FecCodec, InsertConfig, InsertEnvironment,
    InsertError, InsertRequest, InsertToken, LocalBlockStore, LocalProgressStore, ProgressSink,
    ProgressStore, PutCompletionCallback, SplitFileInserter, SplitfileMetadata,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

#[derive(Default)]
struct Outcome {
    metadata: Mutex<Option<SplitfileMetadata>>,
    result: Mutex<Option<Result<(), InsertError>>>,
    done: Notify,
}

impl PutCompletionCallback for Outcome {
    fn on_block_set_finished(&self, _state: &SplitFileInserter) {}

    fn on_metadata(&self, metadata: SplitfileMetadata, _state: &SplitFileInserter) {
        let previous = self.metadata.lock().replace(metadata);
        assert!(previous.is_none(), "metadata delivered twice");
    }

    fn on_fetchable(&self, _state: &SplitFileInserter) {}

    fn on_success(&self, _state: &SplitFileInserter) {
        let previous = self.result.lock().replace(Ok(()));
        assert!(previous.is_none(), "terminal notification delivered twice");
        self.done.notify_one();
    }

    fn on_failure(&self, error: InsertError, _state: &SplitFileInserter) {
        let previous = self.result.lock().replace(Err(error));
        assert!(previous.is_none(), "terminal notification delivered twice");
        self.done.notify_one();
    }
}

struct Quiet;

impl ProgressSink for Quiet {
    fn notify_clients(&self) {}

    fn on_major_progress(&self) {}
}

fn payload(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(len as u64);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

fn config() -> InsertConfig {
    InsertConfig::default()
        .with_segment_sizes(4, 2)
        .with_retries(2, Duration::from_millis(5))
}

fn env(
    outcome: &Arc<Outcome>,
    store: &Arc<LocalBlockStore>,
    progress: Option<Arc<LocalProgressStore>>,
) -> InsertEnvironment {
    InsertEnvironment {
        callback: outcome.clone(),
        parent: Arc::new(Quiet),
        inserter: store.clone(),
        progress_store: progress.map(|p| p as Arc<dyn ProgressStore>),
    }
}

async fn wait(outcome: &Outcome) {
    if outcome.result.lock().is_some() {
        return;
    }
    tokio::time::timeout(Duration::from_secs(60), outcome.done.notified())
        .await
        .expect("insert did not complete");
}

/// Fetch, decrypt and concatenate the data blocks named by `keys`
async fn reassemble(store: &LocalBlockStore, keys: &[BlockKey], length: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(keys.len() * CHK_BLOCK_SIZE);
    for key in keys {
        let block = store.get_block(key).await.unwrap().expect("block stored");
        out.extend_from_slice(&block.decode().unwrap());
    }
    out.truncate(length as usize);
    out
}

#[tokio::test]
async fn full_insert_round_trips_through_store() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalBlockStore::new(dir.path().join("blocks")).await.unwrap());
    let outcome = Arc::new(Outcome::default());

    let data = payload(9 * CHK_BLOCK_SIZE + 1234);
    let request = InsertRequest::new(InsertToken(1))
        .with_client_metadata(ClientMetadata::new().with_mime_type("application/octet-stream"));
    let inserter = SplitFileInserter::new(
        &data[..],
        None,
        data.len() as u64,
        request,
        config(),
        env(&outcome, &store, None),
    )
    .await
    .unwrap();
    assert_eq!(inserter.segments().len(), 3);

    inserter.start().unwrap();
    wait(&outcome).await;

    assert!(matches!(*outcome.result.lock(), Some(Ok(()))));
    let metadata = outcome.metadata.lock().clone().unwrap();
    assert_eq!(metadata.data_keys.len(), 10);
    assert_eq!(metadata.check_keys.len(), 5);
    assert_eq!(metadata.data_length, data.len() as u64);
    assert_eq!(
        metadata.client_metadata.mime_type.as_deref(),
        Some("application/octet-stream")
    );

    let restored = reassemble(&store, &metadata.data_keys, metadata.data_length).await;
    assert_eq!(restored, data);

    // The metadata survives its binary encoding
    let bytes = metadata.to_bytes().unwrap();
    assert_eq!(SplitfileMetadata::from_bytes(&bytes).unwrap(), metadata);
}

#[tokio::test]
async fn check_blocks_recover_lost_data() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalBlockStore::new(dir.path().to_path_buf()).await.unwrap());
    let outcome = Arc::new(Outcome::default());

    let data = payload(4 * CHK_BLOCK_SIZE);
    let inserter = SplitFileInserter::new(
        &data[..],
        None,
        data.len() as u64,
        InsertRequest::new(InsertToken(2)),
        config(),
        env(&outcome, &store, None),
    )
    .await
    .unwrap();
    inserter.start().unwrap();
    wait(&outcome).await;

    let metadata = outcome.metadata.lock().clone().unwrap();
    let codec = FecCodec::for_segment(
        metadata.splitfile_algorithm,
        4,
        metadata.segment_size,
        metadata.check_segment_size,
    )
    .unwrap();
    assert_eq!(codec.check_blocks(), 2);

    let mut shares = Vec::new();
    for key in &metadata.data_keys {
        let block = store.get_block(key).await.unwrap().unwrap();
        shares.push(Some(block.decode().unwrap()));
    }
    let mut checks = Vec::new();
    for key in &metadata.check_keys {
        let block = store.get_block(key).await.unwrap().unwrap();
        checks.push(Some(block.decode().unwrap()));
    }

    let lost = [shares[1].take().unwrap(), shares[3].take().unwrap()];
    codec.decode(&mut shares, &checks).unwrap();
    assert_eq!(shares[1].as_deref(), Some(&lost[0][..]));
    assert_eq!(shares[3].as_deref(), Some(&lost[1][..]));
}

#[tokio::test]
async fn resumed_insert_produces_identical_metadata() {
    let dir = TempDir::new().unwrap();
    let data = payload(9 * CHK_BLOCK_SIZE + 77);

    // Reference run
    let reference_store = Arc::new(LocalBlockStore::new(dir.path().join("a")).await.unwrap());
    let reference = Arc::new(Outcome::default());
    let inserter = SplitFileInserter::new(
        &data[..],
        None,
        data.len() as u64,
        InsertRequest::new(InsertToken(3)),
        config(),
        env(&reference, &reference_store, None),
    )
    .await
    .unwrap();
    inserter.start().unwrap();
    wait(&reference).await;
    let expected = reference.metadata.lock().clone().unwrap();

    // Interrupted run: only the first segment gets to work before the "crash"
    let store = Arc::new(LocalBlockStore::new(dir.path().join("b")).await.unwrap());
    let progress = Arc::new(LocalProgressStore::new(dir.path().join("progress")).await.unwrap());
    let first = Arc::new(Outcome::default());
    let request = InsertRequest::new(InsertToken(4)).with_persistence(true);
    let interrupted = SplitFileInserter::new(
        &data[..],
        None,
        data.len() as u64,
        request.clone(),
        config(),
        env(&first, &store, Some(progress.clone())),
    )
    .await
    .unwrap();

    let name = interrupted.checkpoint_name();
    assert!(progress.load(&name).await.unwrap().is_some());

    let ctx = SegmentContext::new(store.clone(), &config());
    interrupted.segments()[0]
        .start(ctx)
        .unwrap()
        .await
        .unwrap();
    assert!(interrupted.segments()[0].is_finished());

    let record = interrupted.progress_fieldset();
    progress.save(&name, &record).await.unwrap();
    drop(interrupted);

    // Resume from what was saved on disk
    let saved = progress.load(&name).await.unwrap().unwrap();
    let resumed_outcome = Arc::new(Outcome::default());
    let resumed = SplitFileInserter::resume(
        &saved,
        request,
        config(),
        env(&resumed_outcome, &store, Some(progress.clone())),
    )
    .unwrap();
    assert!(resumed.segments()[0].is_finished());
    assert!(!resumed.is_finished());

    resumed.start().unwrap();
    wait(&resumed_outcome).await;

    assert!(matches!(*resumed_outcome.result.lock(), Some(Ok(()))));
    let metadata = resumed_outcome.metadata.lock().clone().unwrap();
    assert_eq!(metadata, expected);

    let restored = reassemble(&store, &metadata.data_keys, metadata.data_length).await;
    assert_eq!(restored, data);

    // The checkpoint is dropped once the insert is done
    let mut removed = false;
    for _ in 0..200 {
        if progress.load(&name).await.unwrap().is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed, "progress record left behind");
}

#[tokio::test]
async fn get_chk_only_stores_nothing() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalBlockStore::new(dir.path().to_path_buf()).await.unwrap());
    let outcome = Arc::new(Outcome::default());

    let data = payload(2 * CHK_BLOCK_SIZE + 5);
    let inserter = SplitFileInserter::new(
        &data[..],
        Some(1),
        10 * data.len() as u64,
        InsertRequest::new(InsertToken(5)).with_get_chk_only(true),
        config(),
        env(&outcome, &store, None),
    )
    .await
    .unwrap();
    inserter.start().unwrap();
    wait(&outcome).await;

    let metadata = outcome.metadata.lock().clone().unwrap();
    assert_eq!(metadata.compression_codec, 1);
    assert_eq!(metadata.decompressed_length, 10 * data.len() as u64);
    for key in metadata.data_keys.iter().chain(&metadata.check_keys) {
        assert!(!store.has_block(key).await);
    }
}

#[tokio::test]
async fn empty_payload_still_completes() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(LocalBlockStore::new(dir.path().to_path_buf()).await.unwrap());
    let outcome = Arc::new(Outcome::default());

    let inserter = SplitFileInserter::new(
        &b""[..],
        None,
        0,
        InsertRequest::new(InsertToken(6)),
        config(),
        env(&outcome, &store, None),
    )
    .await
    .unwrap();
    assert_eq!(inserter.count_data_blocks(), 0);

    inserter.start().unwrap();
    wait(&outcome).await;

    assert!(matches!(*outcome.result.lock(), Some(Ok(()))));
    let metadata = outcome.metadata.lock().clone().unwrap();
    assert!(metadata.data_keys.is_empty());
    assert!(metadata.check_keys.is_empty());
}
