//! Segment state machine
//!
//! A segment owns one contiguous window of data blocks. It inserts the data
//! blocks, runs the redundancy scheme to produce check blocks, derives every
//! block key, inserts the check blocks and then settles. Each monotone
//! milestone (`Encoded`, `HasKeys`, `Fetchable`, `Finished`) is reported to
//! the coordinator as a [`SegmentEvent`] on an unbounded channel.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::chk::ChkBlock;
use crate::codec::{FecCodec, SplitfileAlgorithm};
use crate::config::InsertConfig;
use crate::error::{FailureCodeTracker, InsertError, InsertErrorMode, ResumeError};
use crate::fieldset::FieldSet;
use crate::traits::BlockInserter;
use crate::types::BlockKey;

const SEGMENT_RECORD_TYPE: &str = "SplitFileInserterSegment";

/// Milestone reported by a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentEventKind {
    /// Check blocks computed
    Encoded,
    /// Every data and check block has a key
    HasKeys,
    /// Enough blocks inserted to fetch the segment
    Fetchable,
    /// Every block settled, or the segment failed or was cancelled
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEvent {
    pub seg_no: usize,
    pub kind: SegmentEventKind,
}

/// Shared transfer resources for every segment of one insert
#[derive(Clone)]
pub struct SegmentContext {
    inserter: Arc<dyn BlockInserter>,
    limiter: Arc<Semaphore>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl SegmentContext {
    pub fn new(inserter: Arc<dyn BlockInserter>, config: &InsertConfig) -> Self {
        Self {
            inserter,
            limiter: Arc::new(Semaphore::new(config.max_concurrent_inserts.max(1))),
            max_retries: config.max_insert_retries,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Insertion state of a single block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Pending,
    Inserted,
    /// Gave up after exhausting retries
    Failed,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockState::Pending => "Pending",
            BlockState::Inserted => "Inserted",
            BlockState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

impl FromStr for BlockState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(BlockState::Pending),
            "Inserted" => Ok(BlockState::Inserted),
            "Failed" => Ok(BlockState::Failed),
            other => Err(format!("unknown block state {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Data,
    Check,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Data => f.write_str("data"),
            BlockKind::Check => f.write_str("check"),
        }
    }
}

#[derive(Debug, Clone)]
struct BlockSlot {
    data: Option<Bytes>,
    key: Option<BlockKey>,
    state: BlockState,
}

impl BlockSlot {
    fn pending(data: Option<Bytes>) -> Self {
        Self {
            data,
            key: None,
            state: BlockState::Pending,
        }
    }
}

#[derive(Debug)]
struct SegmentState {
    data: Vec<BlockSlot>,
    check: Vec<BlockSlot>,
    started: bool,
    encoded: bool,
    has_uris: bool,
    fetchable: bool,
    finished: bool,
    cancelled: bool,
    force_encode: bool,
    inserted: usize,
    errors: FailureCodeTracker,
    exception: Option<InsertError>,
}

impl SegmentState {
    fn slots(&self, kind: BlockKind) -> &[BlockSlot] {
        match kind {
            BlockKind::Data => &self.data,
            BlockKind::Check => &self.check,
        }
    }

    fn slots_mut(&mut self, kind: BlockKind) -> &mut [BlockSlot] {
        match kind {
            BlockKind::Data => &mut self.data,
            BlockKind::Check => &mut self.check,
        }
    }

    /// As many blocks inserted as the segment has data blocks
    fn reached_fetchable(&self) -> bool {
        self.inserted >= self.data.len()
    }

    fn all_keys_present(&self) -> bool {
        self.data.iter().chain(&self.check).all(|s| s.key.is_some())
    }

    /// Data payloads feed the encoder, so they stay until encoding is done
    fn needs_payload(&self, kind: BlockKind, slot: &BlockSlot) -> bool {
        match kind {
            BlockKind::Data => !self.encoded || slot.state == BlockState::Pending,
            BlockKind::Check => self.encoded && slot.state == BlockState::Pending,
        }
    }

    fn release_settled(&mut self) {
        let encoded = self.encoded;
        for slot in &mut self.data {
            if encoded && slot.state != BlockState::Pending {
                slot.data = None;
            }
        }
        for slot in &mut self.check {
            if slot.state != BlockState::Pending {
                slot.data = None;
            }
        }
    }
}

/// One FEC-encoding unit of a splitfile
pub struct Segment {
    seg_no: usize,
    codec: FecCodec,
    get_chk_only: bool,
    events: mpsc::UnboundedSender<SegmentEvent>,
    state: Mutex<SegmentState>,
}

impl Segment {
    /// Create a fresh segment over `data` with the codec sized for it
    pub fn new(
        seg_no: usize,
        codec: FecCodec,
        data: Vec<Bytes>,
        get_chk_only: bool,
        events: mpsc::UnboundedSender<SegmentEvent>,
    ) -> Result<Arc<Self>, InsertError> {
        if data.len() != codec.data_blocks() {
            return Err(InsertError::internal(format!(
                "segment {} given {} data blocks for a codec of {}",
                seg_no,
                data.len(),
                codec.data_blocks()
            )));
        }

        let check = (0..codec.check_blocks())
            .map(|_| BlockSlot::pending(None))
            .collect();
        let data = data.into_iter().map(|d| BlockSlot::pending(Some(d))).collect();

        Ok(Arc::new(Self {
            seg_no,
            codec,
            get_chk_only,
            events,
            state: Mutex::new(SegmentState {
                data,
                check,
                started: false,
                encoded: false,
                has_uris: false,
                fetchable: false,
                finished: false,
                cancelled: false,
                force_encode: false,
                inserted: 0,
                errors: FailureCodeTracker::new(),
                exception: None,
            }),
        }))
    }

    pub fn seg_no(&self) -> usize {
        self.seg_no
    }

    pub fn codec(&self) -> &FecCodec {
        &self.codec
    }

    pub fn data_block_count(&self) -> usize {
        self.codec.data_blocks()
    }

    pub fn check_block_count(&self) -> usize {
        self.codec.check_blocks()
    }

    pub fn is_encoded(&self) -> bool {
        self.state.lock().encoded
    }

    pub fn has_uris(&self) -> bool {
        self.state.lock().has_uris
    }

    pub fn is_fetchable(&self) -> bool {
        self.state.lock().fetchable
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Terminal error, if the segment failed
    pub fn exception(&self) -> Option<InsertError> {
        self.state.lock().exception.clone()
    }

    /// Keys of the data blocks, `None` where not yet derived
    pub fn data_keys(&self) -> Vec<Option<BlockKey>> {
        self.state.lock().data.iter().map(|s| s.key).collect()
    }

    /// Keys of the check blocks, `None` where not yet derived
    pub fn check_keys(&self) -> Vec<Option<BlockKey>> {
        self.state.lock().check.iter().map(|s| s.key).collect()
    }

    /// Number of blocks inserted so far
    pub fn inserted_blocks(&self) -> usize {
        self.state.lock().inserted
    }

    /// Spawn the segment's work, `None` if it was already started
    pub fn start(self: &Arc<Self>, ctx: SegmentContext) -> Option<JoinHandle<()>> {
        {
            let mut state = self.state.lock();
            if state.started {
                return None;
            }
            state.started = true;
        }
        let segment = Arc::clone(self);
        Some(tokio::spawn(async move { segment.run(ctx).await }))
    }

    /// Encode before inserting any more data blocks
    pub fn force_encode(&self) {
        let mut state = self.state.lock();
        if !state.encoded && !state.finished {
            state.force_encode = true;
        }
    }

    /// Stop the segment; in-flight work notices between blocks
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        debug!("Cancelling segment {}", self.seg_no);
        state.cancelled = true;
        state.finished = true;
        self.emit(SegmentEventKind::Finished);
    }

    fn emit(&self, kind: SegmentEventKind) {
        let event = SegmentEvent {
            seg_no: self.seg_no,
            kind,
        };
        if self.events.send(event).is_err() {
            trace!("Segment {} event {:?} dropped, coordinator gone", self.seg_no, kind);
        }
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().finished
    }

    async fn run(self: Arc<Self>, ctx: SegmentContext) {
        if self.announce_restored() {
            return;
        }
        debug!("Segment {} starting: {}", self.seg_no, self.codec.params());

        for index in 0..self.data_block_count() {
            if self.is_stopped() {
                return;
            }
            let forced = {
                let state = self.state.lock();
                state.force_encode && !state.encoded
            };
            if forced {
                self.encode().await;
            }
            self.insert_block(BlockKind::Data, index, &ctx).await;
        }

        if self.is_stopped() {
            return;
        }
        self.encode().await;

        for index in 0..self.check_block_count() {
            if self.is_stopped() {
                return;
            }
            self.insert_block(BlockKind::Check, index, &ctx).await;
        }

        self.finish();
    }

    /// Re-emit every milestone already reached; true if already finished
    fn announce_restored(&self) -> bool {
        let state = self.state.lock();
        if state.encoded {
            self.emit(SegmentEventKind::Encoded);
        }
        if state.has_uris {
            self.emit(SegmentEventKind::HasKeys);
        }
        if state.fetchable {
            self.emit(SegmentEventKind::Fetchable);
        }
        if state.finished {
            self.emit(SegmentEventKind::Finished);
        }
        state.finished
    }

    /// Compute check blocks and derive every missing key
    async fn encode(&self) {
        let (data, missing_keys) = {
            let state = self.state.lock();
            if state.encoded || state.finished {
                return;
            }
            let data: Option<Vec<Bytes>> = state.data.iter().map(|s| s.data.clone()).collect();
            let missing: Vec<usize> = (0..state.data.len())
                .filter(|&i| state.data[i].key.is_none())
                .collect();
            (data, missing)
        };
        let Some(data) = data else {
            self.fail(InsertError::internal(format!(
                "segment {} lost a data block before encoding",
                self.seg_no
            )));
            return;
        };

        let codec = self.codec.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<_, InsertError> {
            let checks = codec
                .encode(&data)
                .map_err(|e| InsertError::internal(format!("FEC encode failed: {}", e)))?;
            let check_keys = checks
                .iter()
                .map(|c| ChkBlock::encode(c).map(|b| *b.key()))
                .collect::<Result<Vec<_>, _>>()?;
            let data_keys = missing_keys
                .into_iter()
                .map(|i| ChkBlock::encode(&data[i]).map(|b| (i, *b.key())))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((checks, check_keys, data_keys))
        })
        .await;

        let (checks, check_keys, data_keys) = match result {
            Ok(Ok(encoded)) => encoded,
            Ok(Err(e)) => {
                self.fail(e);
                return;
            }
            Err(e) => {
                self.fail(InsertError::internal(format!("encode task failed: {}", e)));
                return;
            }
        };

        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        for ((slot, payload), key) in state.check.iter_mut().zip(checks).zip(check_keys) {
            slot.data = Some(Bytes::from(payload));
            slot.key = Some(key);
        }
        for (index, key) in data_keys {
            state.data[index].key.get_or_insert(key);
        }
        state.encoded = true;
        state.force_encode = false;
        state.release_settled();
        debug!(
            "Segment {} encoded {} check blocks",
            self.seg_no,
            state.check.len()
        );
        self.emit(SegmentEventKind::Encoded);

        if !state.has_uris && state.all_keys_present() {
            state.has_uris = true;
            self.emit(SegmentEventKind::HasKeys);
        }
    }

    async fn insert_block(&self, kind: BlockKind, index: usize, ctx: &SegmentContext) {
        let payload = {
            let state = self.state.lock();
            let slot = &state.slots(kind)[index];
            if state.finished || slot.state != BlockState::Pending {
                return;
            }
            slot.data.clone()
        };
        let Some(payload) = payload else {
            self.fail(InsertError::internal(format!(
                "segment {} {} block {} has no payload",
                self.seg_no, kind, index
            )));
            return;
        };

        let block = match ChkBlock::encode(&payload) {
            Ok(block) => block,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        self.state.lock().slots_mut(kind)[index]
            .key
            .get_or_insert(*block.key());

        if !self.get_chk_only {
            let mut attempt = 0;
            loop {
                let result = match ctx.limiter.acquire().await {
                    Ok(_permit) => ctx.inserter.put_block(&block).await,
                    Err(_) => Err(InsertError::internal("insert limiter closed")),
                };
                match result {
                    Ok(()) => break,
                    Err(e) if e.is_fatal() => {
                        warn!(
                            "Segment {} {} block {} failed fatally: {}",
                            self.seg_no, kind, index, e
                        );
                        self.fail(e);
                        return;
                    }
                    Err(e) => {
                        attempt += 1;
                        if attempt > ctx.max_retries {
                            debug!(
                                "Segment {} {} block {} out of retries: {}",
                                self.seg_no, kind, index, e
                            );
                            self.record_failure(kind, index, e.mode());
                            return;
                        }
                        trace!(
                            "Retrying {} block {} of segment {} ({}): {}",
                            kind, index, self.seg_no, attempt, e
                        );
                        tokio::time::sleep(ctx.retry_backoff).await;
                        if self.is_stopped() {
                            return;
                        }
                    }
                }
            }
        }

        self.mark_inserted(kind, index);
    }

    fn mark_inserted(&self, kind: BlockKind, index: usize) {
        let mut state = self.state.lock();
        let slot = &mut state.slots_mut(kind)[index];
        if slot.state != BlockState::Pending {
            return;
        }
        slot.state = BlockState::Inserted;
        state.inserted += 1;
        state.release_settled();
        self.update_fetchable(&mut state);
    }

    fn update_fetchable(&self, state: &mut SegmentState) {
        if !state.fetchable && !state.finished && state.reached_fetchable() {
            state.fetchable = true;
            self.emit(SegmentEventKind::Fetchable);
        }
    }

    fn record_failure(&self, kind: BlockKind, index: usize, mode: InsertErrorMode) {
        let mut state = self.state.lock();
        state.slots_mut(kind)[index].state = BlockState::Failed;
        state.errors.inc(mode);
        state.release_settled();
    }

    /// Settle the segment once every block has been attempted
    fn finish(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        self.update_fetchable(&mut state);
        state.finished = true;
        if !state.errors.is_empty() {
            state.exception = Some(InsertError::from_tracker(&state.errors));
        }
        match &state.exception {
            Some(e) => debug!("Segment {} finished with failure: {}", self.seg_no, e),
            None => debug!("Segment {} finished", self.seg_no),
        }
        self.emit(SegmentEventKind::Finished);
    }

    /// Terminate the segment with `error`
    fn fail(&self, error: InsertError) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.errors.inc(error.mode());
        state.exception = Some(error);
        state.finished = true;
        self.emit(SegmentEventKind::Finished);
    }

    /// Snapshot of the segment as a recoverable field set
    pub fn progress_fieldset(&self) -> FieldSet {
        let state = self.state.lock();
        let mut fs = FieldSet::new();
        fs.put_single("Type", SEGMENT_RECORD_TYPE);
        fs.put("SegmentNumber", self.seg_no);
        fs.put("Encoded", state.encoded);
        // A cancelled segment has not really finished and must run again
        fs.put("Finished", state.finished && !state.cancelled);
        fs.put("Fetchable", state.fetchable);
        if !state.errors.is_empty() {
            fs.put_subset("Errors", state.errors.to_fieldset());
        }
        if let Some(e) = &state.exception {
            if !state.cancelled {
                fs.put_subset("Exception", e.to_fieldset());
            }
        }
        fs.put_subset("DataBlocks", blocks_fieldset(&state.data));
        fs.put_subset("CheckBlocks", blocks_fieldset(&state.check));
        fs
    }

    /// Rebuild a segment from its progress record
    pub fn restore(
        fs: &FieldSet,
        seg_no: usize,
        algorithm: SplitfileAlgorithm,
        segment_size: i32,
        check_segment_size: i32,
        get_chk_only: bool,
        events: mpsc::UnboundedSender<SegmentEvent>,
    ) -> Result<Arc<Self>, ResumeError> {
        let field = |key: &str| ResumeError::new(format!("Segment {}: missing {}", seg_no, key));
        let corrupt =
            |e: crate::fieldset::FieldSetError| ResumeError::new(format!("Segment {}: {}", seg_no, e));

        if let Some(kind) = fs.get("Type") {
            if kind != SEGMENT_RECORD_TYPE {
                return Err(ResumeError::new(format!(
                    "Segment {}: unexpected record type {}",
                    seg_no, kind
                )));
            }
        }
        let recorded: usize = fs
            .get_parsed("SegmentNumber")
            .map_err(corrupt)?
            .ok_or_else(|| field("SegmentNumber"))?;
        if recorded != seg_no {
            return Err(ResumeError::new(format!(
                "Segment record {} found at position {}",
                recorded, seg_no
            )));
        }
        let encoded: bool = fs
            .get_parsed("Encoded")
            .map_err(corrupt)?
            .ok_or_else(|| field("Encoded"))?;
        let finished: bool = fs.get_parsed("Finished").map_err(corrupt)?.unwrap_or(false);
        let fetchable: Option<bool> = fs.get_parsed("Fetchable").map_err(corrupt)?;

        let data = blocks_from_fieldset(
            fs.subset("DataBlocks").ok_or_else(|| field("DataBlocks"))?,
            seg_no,
        )?;
        let check = blocks_from_fieldset(
            fs.subset("CheckBlocks").ok_or_else(|| field("CheckBlocks"))?,
            seg_no,
        )?;

        let codec = FecCodec::for_segment(algorithm, data.len(), segment_size, check_segment_size)
            .map_err(|e| ResumeError::new(format!("Segment {}: {}", seg_no, e)))?;
        if codec.check_blocks() != check.len() {
            return Err(ResumeError::new(format!(
                "Segment {}: {} check blocks recorded, scheme {} needs {}",
                seg_no,
                check.len(),
                algorithm,
                codec.check_blocks()
            )));
        }

        let errors = fs
            .subset("Errors")
            .map(FailureCodeTracker::from_fieldset)
            .transpose()?
            .unwrap_or_default();
        let exception = fs
            .subset("Exception")
            .map(InsertError::from_fieldset)
            .transpose()?;

        let inserted = data
            .iter()
            .chain(&check)
            .filter(|s| s.state == BlockState::Inserted)
            .count();
        let mut state = SegmentState {
            data,
            check,
            started: false,
            encoded,
            has_uris: false,
            fetchable: false,
            finished,
            cancelled: false,
            force_encode: false,
            inserted,
            errors,
            exception,
        };

        if !finished {
            for kind in [BlockKind::Data, BlockKind::Check] {
                for (index, slot) in state.slots(kind).iter().enumerate() {
                    if state.needs_payload(kind, slot) && slot.data.is_none() {
                        return Err(ResumeError::new(format!(
                            "Segment {}: {} block {} has no payload",
                            seg_no, kind, index
                        )));
                    }
                }
            }
        }
        if encoded && !state.all_keys_present() {
            return Err(ResumeError::new(format!(
                "Segment {}: encoded but missing keys",
                seg_no
            )));
        }
        state.has_uris = encoded && state.all_keys_present();
        // Records without the flag predate it: derive it the way a live
        // segment would have before settling
        state.fetchable = fetchable.unwrap_or_else(|| state.reached_fetchable());

        Ok(Arc::new(Self {
            seg_no,
            codec,
            get_chk_only,
            events,
            state: Mutex::new(state),
        }))
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("seg_no", &self.seg_no)
            .field("params", &self.codec.params())
            .finish_non_exhaustive()
    }
}

fn blocks_fieldset(slots: &[BlockSlot]) -> FieldSet {
    let mut fs = FieldSet::new();
    fs.put("Count", slots.len());
    for (index, slot) in slots.iter().enumerate() {
        let mut block = FieldSet::new();
        block.put("State", slot.state);
        if let Some(key) = &slot.key {
            block.put("Key", key);
        }
        if let Some(data) = &slot.data {
            block.put_single("Data", hex::encode(data));
        }
        fs.put_subset(&index.to_string(), block);
    }
    fs
}

fn blocks_from_fieldset(fs: &FieldSet, seg_no: usize) -> Result<Vec<BlockSlot>, ResumeError> {
    let corrupt = |e: crate::fieldset::FieldSetError| {
        ResumeError::new(format!("Segment {}: {}", seg_no, e))
    };
    let count: usize = fs
        .get_parsed("Count")
        .map_err(corrupt)?
        .ok_or_else(|| ResumeError::new(format!("Segment {}: missing block count", seg_no)))?;

    (0..count)
        .map(|index| {
            let block = fs.subset(&index.to_string()).ok_or_else(|| {
                ResumeError::new(format!("Segment {}: missing block {}", seg_no, index))
            })?;
            let state: BlockState = block
                .get_parsed("State")
                .map_err(corrupt)?
                .unwrap_or(BlockState::Pending);
            let key: Option<BlockKey> = block.get_parsed("Key").map_err(corrupt)?;
            let data = block
                .get("Data")
                .map(|text| {
                    hex::decode(text).map(Bytes::from).map_err(|e| {
                        ResumeError::new(format!(
                            "Segment {}: corrupt payload of block {}: {}",
                            seg_no, index, e
                        ))
                    })
                })
                .transpose()?;
            Ok(BlockSlot { data, key, state })
        })
        .collect()
}
