// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! # Splitfile Insert - Segmented FEC insertion for content-addressed storage
//!
//! This crate takes an already-compressed payload, splits it into CHK-sized
//! blocks, groups the blocks into segments, FEC-encodes every segment into
//! check blocks, drives block insertion, and assembles the resulting
//! content-hash keys into splitfile metadata once every segment has its keys.
//!
//! ## Features
//! - Systematic Reed-Solomon check blocks per segment
//! - Convergent CHK block keys (AES-256-GCM + SHA-256 routing key)
//! - Concurrent, independently completing segment state machines
//! - Exactly-once whole-insert notifications (metadata, fetchable, success/failure)
//! - Crash-safe resume from a recoverable field-set progress record

use thiserror::Error;

pub mod backends;
pub mod bucket;
pub mod chk;
pub mod codec;
pub mod config;
pub mod error;
pub mod fieldset;
pub mod inserter;
pub mod metadata;
pub mod segment;
pub mod storage;
pub mod traits;
pub mod types;

pub use chk::ChkBlock;
pub use codec::{FecCodec, FecParams, SplitfileAlgorithm};
pub use config::InsertConfig;
pub use error::{FailureCodeTracker, InsertError, InsertErrorMode, ResumeError};
pub use fieldset::{FieldSet, FieldSetError};
pub use inserter::{InsertEnvironment, InsertRequest, SplitFileInserter};
pub use metadata::{ClientMetadata, SplitfileMetadata};
pub use segment::{Segment, SegmentEvent, SegmentEventKind};
pub use storage::{LocalBlockStore, LocalProgressStore, MemoryBlockStore, ProgressStore};
pub use traits::{BlockInserter, FecBackend, ProgressSink, PutCompletionCallback};
pub use types::{BlockKey, InsertToken, InserterId};

/// Payload size of a single CHK block in bytes
pub const CHK_BLOCK_SIZE: usize = 32 * 1024;

/// Compression codec id recorded when the payload was not compressed
pub const NO_COMPRESSION: i16 = -1;

/// Errors that can occur during FEC operations
#[derive(Debug, Error)]
pub enum FecError {
    #[error("Invalid parameters: data={data}, check={check}")]
    InvalidParameters { data: usize, check: usize },

    #[error("Data size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Insufficient blocks for reconstruction: have {have}, need {need}")]
    InsufficientBlocks { have: usize, need: usize },

    #[error("Backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, FecError>;
