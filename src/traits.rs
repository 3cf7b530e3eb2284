// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core traits at the boundaries of the inserter

use async_trait::async_trait;
use std::fmt;

use crate::Result;
use crate::chk::ChkBlock;
use crate::error::InsertError;
use crate::inserter::SplitFileInserter;
use crate::metadata::SplitfileMetadata;

/// Backend trait for different FEC implementations
pub trait FecBackend: Send + Sync + fmt::Debug {
    /// Compute `check_count` check blocks over equally sized data blocks
    fn encode_blocks(&self, data: &[&[u8]], check_count: usize) -> Result<Vec<Vec<u8>>>;

    /// Restore missing data blocks in place from the surviving data and check blocks
    fn decode_blocks(&self, data: &mut [Option<Vec<u8>>], check: &[Option<Vec<u8>>]) -> Result<()>;

    /// Check if backend supports hardware acceleration
    fn is_accelerated(&self) -> bool {
        false
    }

    /// Get backend name for debugging
    fn name(&self) -> &'static str;
}

/// Consumer of whole-insert milestones
///
/// Each method fires at most once per insert, and exactly one of
/// [`on_success`](Self::on_success) / [`on_failure`](Self::on_failure)
/// fires per insert. Calls may arrive on any thread.
pub trait PutCompletionCallback: Send + Sync {
    /// Every segment is encoded; no more blocks will be added
    fn on_block_set_finished(&self, state: &SplitFileInserter);

    /// Every block has a key and the splitfile metadata is built
    fn on_metadata(&self, metadata: SplitfileMetadata, state: &SplitFileInserter);

    /// Enough blocks are inserted for the content to be fetched
    fn on_fetchable(&self, state: &SplitFileInserter);

    fn on_success(&self, state: &SplitFileInserter);

    fn on_failure(&self, error: InsertError, state: &SplitFileInserter);
}

/// Coarse progress signalling towards the owner of the insert
pub trait ProgressSink: Send + Sync {
    /// Something observable changed
    fn notify_clients(&self);

    /// A milestone worth persisting was reached
    fn on_major_progress(&self);
}

/// Transfer of finished CHK blocks into the network
#[async_trait]
pub trait BlockInserter: Send + Sync {
    /// Insert a block under its routing key
    async fn put_block(&self, block: &ChkBlock) -> std::result::Result<(), InsertError>;
}
