// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Splitfile insert coordinator
//!
//! [`SplitFileInserter`] splits a payload into segments, starts them, and
//! folds their independent milestones into whole-insert notifications:
//!
//! - block set finished, once every segment is encoded
//! - metadata, once every segment has all of its keys
//! - fetchable, once every segment is fetchable
//! - success or failure, exactly once, when every segment has settled or a
//!   segment failed fatally
//!
//! Segment milestones arrive as [`SegmentEvent`]s over a channel drained by
//! a single aggregation task. Every handler re-checks the state of *all*
//! segments rather than counting events, so duplicate or re-ordered events
//! from a resumed insert are harmless.

use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bucket;
use crate::codec::{FecCodec, SplitfileAlgorithm};
use crate::config::InsertConfig;
use crate::error::{FailureCodeTracker, InsertError, ResumeError};
use crate::fieldset::{FieldSet, FieldSetError};
use crate::metadata::{ClientMetadata, SplitfileMetadata};
use crate::segment::{Segment, SegmentContext, SegmentEvent, SegmentEventKind};
use crate::storage::ProgressStore;
use crate::traits::{BlockInserter, ProgressSink, PutCompletionCallback};
use crate::types::{BlockKey, InsertToken, InserterId};
use crate::{CHK_BLOCK_SIZE, NO_COMPRESSION};

const INSERTER_RECORD_TYPE: &str = "SplitFileInserter";

/// Above this many data blocks, milestones are worth persisting
const MAJOR_PROGRESS_BLOCKS: usize = 32;

/// What to insert and how the result is flagged
#[derive(Debug, Clone)]
pub struct InsertRequest {
    pub client_metadata: ClientMetadata,
    /// Derive keys without transferring any block
    pub get_chk_only: bool,
    pub is_metadata: bool,
    pub insert_as_archive_manifest: bool,
    /// Checkpoint progress so the insert can be resumed
    pub persistent: bool,
    /// Caller correlation id
    pub token: InsertToken,
}

impl InsertRequest {
    pub fn new(token: InsertToken) -> Self {
        Self {
            client_metadata: ClientMetadata::default(),
            get_chk_only: false,
            is_metadata: false,
            insert_as_archive_manifest: false,
            persistent: false,
            token,
        }
    }

    pub fn with_client_metadata(mut self, client_metadata: ClientMetadata) -> Self {
        self.client_metadata = client_metadata;
        self
    }

    pub fn with_get_chk_only(mut self, get_chk_only: bool) -> Self {
        self.get_chk_only = get_chk_only;
        self
    }

    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Collaborators of an insert
#[derive(Clone)]
pub struct InsertEnvironment {
    pub callback: Arc<dyn PutCompletionCallback>,
    pub parent: Arc<dyn ProgressSink>,
    pub inserter: Arc<dyn BlockInserter>,
    pub progress_store: Option<Arc<dyn ProgressStore>>,
}

#[derive(Debug, Default)]
struct InserterState {
    finished: bool,
    have_sent_metadata: bool,
    fetchable: bool,
    force_encode: bool,
    block_set_finished: bool,
}

/// Top-level coordinator of one splitfile insert
pub struct SplitFileInserter {
    id: InserterId,
    data_length: u64,
    decompressed_length: u64,
    compression_codec: i16,
    splitfile_algorithm: SplitfileAlgorithm,
    segment_size: i32,
    check_segment_size: i32,
    segments: Vec<Arc<Segment>>,
    count_data_blocks: usize,
    count_check_blocks: usize,
    request: InsertRequest,
    env: InsertEnvironment,
    ctx: SegmentContext,
    state: Mutex<InserterState>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SegmentEvent>>>,
}

impl SplitFileInserter {
    /// Split `reader` into segments ready to be started
    ///
    /// `compression_codec` is `None` for an uncompressed payload.
    pub async fn new<R>(
        reader: R,
        compression_codec: Option<i16>,
        decompressed_length: u64,
        request: InsertRequest,
        config: InsertConfig,
        env: InsertEnvironment,
    ) -> Result<Arc<Self>, InsertError>
    where
        R: AsyncRead + Unpin,
    {
        config
            .validate()
            .map_err(|e| InsertError::internal(format!("{:#}", e)))?;

        let (blocks, data_length) = bucket::split_into_blocks(reader, CHK_BLOCK_SIZE)
            .await
            .map_err(|e| InsertError::bucket(format!("Failed to split payload: {}", e)))?;

        let algorithm = config.splitfile_algorithm;
        let segment_size = config.segment_data_blocks;
        let check_segment_size = config.effective_check_segment_size();
        let count_data_blocks = blocks.len();

        let (tx, rx) = mpsc::unbounded_channel();
        let ranges = bucket::partition(count_data_blocks, segment_size);
        let mut blocks = blocks.into_iter();
        let mut segments = Vec::with_capacity(ranges.len());
        for (seg_no, range) in ranges.into_iter().enumerate() {
            let data: Vec<_> = blocks.by_ref().take(range.len()).collect();
            let codec =
                FecCodec::for_segment(algorithm, data.len(), segment_size, check_segment_size)
                    .map_err(|e| InsertError::internal(e.to_string()))?;
            segments.push(Segment::new(
                seg_no,
                codec,
                data,
                request.get_chk_only,
                tx.clone(),
            )?);
        }

        info!(
            "Splitting {} bytes into {} data blocks over {} segments ({})",
            data_length,
            count_data_blocks,
            segments.len(),
            algorithm
        );

        let inserter = Arc::new(Self::assemble(
            data_length,
            decompressed_length,
            compression_codec.unwrap_or(NO_COMPRESSION),
            algorithm,
            segment_size,
            check_segment_size,
            segments,
            request,
            &config,
            env,
            rx,
        ));
        inserter.env.parent.on_major_progress();
        inserter.env.parent.notify_clients();
        inserter.checkpoint().await;
        Ok(inserter)
    }

    /// Rebuild an insert from its progress record
    ///
    /// `config` supplies the retry and concurrency policy; sizing and the
    /// redundancy scheme come from the record.
    pub fn resume(
        fs: &FieldSet,
        request: InsertRequest,
        config: InsertConfig,
        env: InsertEnvironment,
    ) -> Result<Arc<Self>, ResumeError> {
        fn corrupt(e: FieldSetError) -> ResumeError {
            ResumeError::new(e.to_string())
        }
        fn required<T>(fs: &FieldSet, key: &str) -> Result<T, ResumeError>
        where
            T: std::str::FromStr,
            T::Err: fmt::Display,
        {
            fs.get_parsed(key)
                .map_err(corrupt)?
                .ok_or_else(|| ResumeError::new(format!("No {}", key)))
        }

        if let Some(kind) = fs.get("Type") {
            if kind != INSERTER_RECORD_TYPE {
                return Err(ResumeError::new(format!("Unexpected record type {}", kind)));
            }
        }

        let data_length: u64 = required(fs, "DataLength")?;
        // Older records predate this field
        let decompressed_length: u64 = fs
            .get_parsed("DecompressedLength")
            .map_err(corrupt)?
            .unwrap_or(0);
        let segment_size: i32 = required(fs, "SegmentSize")?;
        let check_segment_size: i32 = required(fs, "CheckSegmentSize")?;
        let compression_codec: i16 = required(fs, "CompressionCodec")?;
        let algorithm_id: i16 = required(fs, "SplitfileCodec")?;
        let algorithm = SplitfileAlgorithm::from_id(algorithm_id)
            .ok_or_else(|| ResumeError::new(format!("Unknown splitfile codec {}", algorithm_id)))?;
        let count: usize = required(fs, "Segments.Count")?;
        if count == 0 {
            return Err(ResumeError::new("No segments"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let segments = (0..count)
            .map(|seg_no| {
                let record = fs
                    .subset(&format!("Segments.{}", seg_no))
                    .ok_or_else(|| ResumeError::new(format!("No segment {}", seg_no)))?;
                Segment::restore(
                    record,
                    seg_no,
                    algorithm,
                    segment_size,
                    check_segment_size,
                    request.get_chk_only,
                    tx.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let count_data_blocks: usize = segments.iter().map(|s| s.data_block_count()).sum();
        let expected = data_length.div_ceil(CHK_BLOCK_SIZE as u64);
        if count_data_blocks as u64 != expected {
            return Err(ResumeError::new(format!(
                "{} data blocks recorded for {} bytes",
                count_data_blocks, data_length
            )));
        }

        info!(
            "Resuming insert {} of {} bytes over {} segments",
            request.token, data_length, count
        );

        // Completion is re-derived from segment events, never trusted
        Ok(Arc::new(Self::assemble(
            data_length,
            decompressed_length,
            compression_codec,
            algorithm,
            segment_size,
            check_segment_size,
            segments,
            request,
            &config,
            env,
            rx,
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        data_length: u64,
        decompressed_length: u64,
        compression_codec: i16,
        splitfile_algorithm: SplitfileAlgorithm,
        segment_size: i32,
        check_segment_size: i32,
        segments: Vec<Arc<Segment>>,
        request: InsertRequest,
        config: &InsertConfig,
        env: InsertEnvironment,
        events: mpsc::UnboundedReceiver<SegmentEvent>,
    ) -> Self {
        let count_data_blocks = segments.iter().map(|s| s.data_block_count()).sum();
        let count_check_blocks = segments.iter().map(|s| s.check_block_count()).sum();
        let ctx = SegmentContext::new(Arc::clone(&env.inserter), config);
        Self {
            id: InserterId::next(),
            data_length,
            decompressed_length,
            compression_codec,
            splitfile_algorithm,
            segment_size,
            check_segment_size,
            segments,
            count_data_blocks,
            count_check_blocks,
            request,
            env,
            ctx,
            state: Mutex::new(InserterState::default()),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn id(&self) -> InserterId {
        self.id
    }

    pub fn token(&self) -> InsertToken {
        self.request.token
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn decompressed_length(&self) -> u64 {
        self.decompressed_length
    }

    pub fn compression_codec(&self) -> i16 {
        self.compression_codec
    }

    pub fn splitfile_algorithm(&self) -> SplitfileAlgorithm {
        self.splitfile_algorithm
    }

    pub fn segment_size(&self) -> i32 {
        self.segment_size
    }

    pub fn check_segment_size(&self) -> i32 {
        self.check_segment_size
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    pub fn count_data_blocks(&self) -> usize {
        self.count_data_blocks
    }

    pub fn count_check_blocks(&self) -> usize {
        self.count_check_blocks
    }

    pub fn is_persistent(&self) -> bool {
        self.request.persistent
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_fetchable(&self) -> bool {
        self.state.lock().fetchable
    }

    pub fn has_sent_metadata(&self) -> bool {
        self.state.lock().have_sent_metadata
    }

    pub fn is_block_set_finished(&self) -> bool {
        self.state.lock().block_set_finished
    }

    /// Name of this insert's record in the progress store
    pub fn checkpoint_name(&self) -> String {
        format!("splitfile-{}", self.request.token)
    }

    fn is_large(&self) -> bool {
        self.count_data_blocks > MAJOR_PROGRESS_BLOCKS
    }

    /// Start every segment and the aggregation task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), InsertError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| InsertError::internal(format!("{} already started", self.id)))?;

        info!(
            "Starting {}: {} data + {} check blocks",
            self.id, self.count_data_blocks, self.count_check_blocks
        );
        let inserter = Arc::clone(self);
        tokio::spawn(async move { inserter.run_events(events).await });

        for segment in &self.segments {
            segment.start(self.ctx.clone());
        }

        if self.is_large() {
            self.env.parent.on_major_progress();
        }
        self.env.parent.notify_clients();
        Ok(())
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SegmentEvent>) {
        self.checkpoint().await;

        while let Some(event) = events.recv().await {
            let Some(segment) = self.segments.get(event.seg_no).cloned() else {
                warn!("{}: event from unknown segment {}", self.id, event.seg_no);
                continue;
            };

            let persist = match event.kind {
                SegmentEventKind::Encoded => {
                    let before = self.is_block_set_finished();
                    self.on_segment_encoded(&segment);
                    !before && self.is_block_set_finished()
                }
                SegmentEventKind::HasKeys => {
                    self.on_segment_has_keys(&segment);
                    false
                }
                SegmentEventKind::Fetchable => {
                    self.on_segment_fetchable(&segment);
                    false
                }
                SegmentEventKind::Finished => {
                    self.on_segment_finished(&segment);
                    true
                }
            };

            if self.is_finished() {
                break;
            }
            if persist {
                self.checkpoint().await;
            }
        }

        if self.is_finished() {
            self.discard_checkpoint().await;
        }
        debug!("{}: aggregation finished", self.id);
    }

    async fn checkpoint(&self) {
        if !self.request.persistent {
            return;
        }
        let Some(store) = &self.env.progress_store else {
            return;
        };
        let record = self.progress_fieldset();
        if let Err(e) = store.save(&self.checkpoint_name(), &record).await {
            warn!("{}: failed to save progress: {:#}", self.id, e);
        }
    }

    async fn discard_checkpoint(&self) {
        if !self.request.persistent {
            return;
        }
        if let Some(store) = &self.env.progress_store {
            if let Err(e) = store.remove(&self.checkpoint_name()).await {
                warn!("{}: failed to remove progress record: {:#}", self.id, e);
            }
        }
    }

    /// A segment computed its check blocks
    pub fn on_segment_encoded(&self, segment: &Segment) {
        {
            let mut state = self.state.lock();
            if state.force_encode {
                segment.force_encode();
            }
            if state.finished
                || state.block_set_finished
                || !self.segments.iter().all(|s| s.is_encoded())
            {
                return;
            }
            state.block_set_finished = true;
        }

        debug!("{}: block set finished", self.id);
        self.env.callback.on_block_set_finished(self);
        if self.is_large() {
            self.env.parent.on_major_progress();
        }
    }

    /// A segment has keys for every block
    pub fn on_segment_has_keys(&self, segment: &Segment) {
        let metadata = {
            let mut state = self.state.lock();
            if state.have_sent_metadata || state.finished {
                return;
            }
            if !self.segments.iter().all(|s| s.has_uris()) {
                debug!(
                    "{}: segment {} has keys, waiting for others",
                    self.id,
                    segment.seg_no()
                );
                return;
            }
            state.have_sent_metadata = true;
            self.build_metadata()
        };

        match metadata {
            Ok(metadata) => {
                info!(
                    "{}: metadata ready ({} data keys, {} check keys)",
                    self.id,
                    metadata.data_keys.len(),
                    metadata.check_keys.len()
                );
                self.env.callback.on_metadata(metadata, self);
            }
            Err(e) => {
                error!("{}: cannot build metadata: {}", self.id, e);
                self.fail(e);
            }
        }
    }

    fn build_metadata(&self) -> Result<SplitfileMetadata, InsertError> {
        let data_keys = collect_keys(
            self.segments.iter().map(|s| s.data_keys()),
            self.count_data_blocks,
            "data",
        )?;
        let check_keys = collect_keys(
            self.segments.iter().map(|s| s.check_keys()),
            self.count_check_blocks,
            "check",
        )?;

        Ok(SplitfileMetadata {
            splitfile_algorithm: self.splitfile_algorithm,
            data_keys,
            check_keys,
            segment_size: self.segment_size,
            check_segment_size: self.check_segment_size,
            client_metadata: self.request.client_metadata.clone(),
            data_length: self.data_length,
            compression_codec: self.compression_codec,
            decompressed_length: self.decompressed_length,
            is_metadata: self.request.is_metadata,
            insert_as_archive_manifest: self.request.insert_as_archive_manifest,
        })
    }

    /// A segment became fetchable
    pub fn on_segment_fetchable(&self, _segment: &Segment) {
        {
            let mut state = self.state.lock();
            if state.finished || state.fetchable {
                return;
            }
            if !self.segments.iter().all(|s| s.is_fetchable()) {
                return;
            }
            state.fetchable = true;
        }
        debug!("{}: fetchable", self.id);
        self.env.callback.on_fetchable(self);
    }

    /// A segment settled, failed or was cancelled
    ///
    /// Segments keep running while their events wait in the queue, so by the
    /// time every segment reports finished the encoded, has-keys and
    /// fetchable events may not have been seen yet. Those milestones are
    /// re-derived from segment state before the terminal notification.
    pub fn on_segment_finished(&self, segment: &Segment) {
        if self.is_large() {
            self.env.parent.on_major_progress();
        }
        let fatal = {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            let fatal = segment.exception().filter(InsertError::is_fatal);
            if let Some(e) = &fatal {
                warn!(
                    "{}: segment {} failed fatally ({}), cancelling insert",
                    self.id,
                    segment.seg_no(),
                    e
                );
                for other in &self.segments {
                    other.cancel();
                }
                state.finished = true;
            } else if !self.segments.iter().all(|s| s.is_finished()) {
                return;
            }
            fatal.is_some()
        };
        if !fatal {
            self.on_segment_encoded(segment);
            self.on_segment_has_keys(segment);
            self.on_segment_fetchable(segment);

            let mut state = self.state.lock();
            // Building the metadata may already have failed the insert
            if state.finished {
                return;
            }
            state.finished = true;
        }
        self.on_all_finished();
    }

    /// Deliver the terminal notification
    fn on_all_finished(&self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut tracker = FailureCodeTracker::new();
            let mut failed = false;
            for segment in &self.segments {
                if let Some(e) = segment.exception() {
                    failed = true;
                    match e.codes() {
                        Some(codes) => tracker.merge(codes),
                        None => tracker.inc(e.mode()),
                    }
                }
            }
            failed.then(|| InsertError::from_tracker(&tracker))
        }));

        match outcome {
            Ok(None) => {
                info!("{}: insert succeeded", self.id);
                self.env.callback.on_success(self);
            }
            Ok(Some(e)) => {
                warn!("{}: insert failed: {}", self.id, e);
                self.env.callback.on_failure(e, self);
            }
            Err(_) => {
                error!("{}: final aggregation panicked", self.id);
                self.env
                    .callback
                    .on_failure(InsertError::internal("final aggregation panicked"), self);
            }
        }
    }

    /// Ask every segment to encode as soon as possible
    pub fn force_encode(&self) {
        let mut state = self.state.lock();
        if state.force_encode || state.finished {
            return;
        }
        state.force_encode = true;
        for segment in &self.segments {
            segment.force_encode();
        }
    }

    /// Abandon the insert
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            for segment in &self.segments {
                segment.cancel();
            }
        }
        info!("{}: cancelled", self.id);
        self.env.callback.on_failure(InsertError::cancelled(), self);
    }

    fn fail(&self, error: InsertError) {
        {
            let mut state = self.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            for segment in &self.segments {
                segment.cancel();
            }
        }
        self.env.callback.on_failure(error, self);
    }

    /// Snapshot of the whole insert as a recoverable field set
    pub fn progress_fieldset(&self) -> FieldSet {
        let mut fs = FieldSet::new();
        fs.put_single("Type", INSERTER_RECORD_TYPE);
        fs.put("DataLength", self.data_length);
        fs.put("DecompressedLength", self.decompressed_length);
        fs.put("CompressionCodec", self.compression_codec);
        fs.put("SplitfileCodec", self.splitfile_algorithm.id());
        fs.put("Finished", self.is_finished());
        fs.put("SegmentSize", self.segment_size);
        fs.put("CheckSegmentSize", self.check_segment_size);

        let mut segments = FieldSet::new();
        segments.put("Count", self.segments.len());
        for segment in &self.segments {
            segments.put_subset(&segment.seg_no().to_string(), segment.progress_fieldset());
        }
        fs.put_subset("Segments", segments);
        fs
    }
}

fn collect_keys(
    per_segment: impl Iterator<Item = Vec<Option<BlockKey>>>,
    expected: usize,
    kind: &str,
) -> Result<Vec<BlockKey>, InsertError> {
    let mut keys = Vec::with_capacity(expected);
    for (seg_no, segment_keys) in per_segment.enumerate() {
        for (index, key) in segment_keys.into_iter().enumerate() {
            if keys.len() == expected {
                return Err(InsertError::internal(format!(
                    "too many {} keys: segment {} block {} beyond {}",
                    kind, seg_no, index, expected
                )));
            }
            let key = key.ok_or_else(|| {
                InsertError::internal(format!(
                    "missing {} key: segment {} block {}",
                    kind, seg_no, index
                ))
            })?;
            keys.push(key);
        }
    }
    if keys.len() != expected {
        return Err(InsertError::internal(format!(
            "{} {} keys collected, expected {}",
            keys.len(),
            kind,
            expected
        )));
    }
    Ok(keys)
}

impl PartialEq for SplitFileInserter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SplitFileInserter {}

impl Hash for SplitFileInserter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for SplitFileInserter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitFileInserter")
            .field("id", &self.id)
            .field("token", &self.request.token)
            .field("data_length", &self.data_length)
            .field("segments", &self.segments.len())
            .field("state", &*self.state.lock())
            .finish()
    }
}
