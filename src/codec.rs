// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! # Redundancy schemes for splitfile segments
//!
//! A segment of `d` data blocks is protected by `c` check blocks, where `c`
//! depends only on the scheme and on `d` (never on content). That lets the
//! inserter know its total check-block count before anything is encoded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::backends::{self, reed_solomon::MAX_BLOCKS_PER_SEGMENT};
use crate::{CHK_BLOCK_SIZE, FecBackend, FecError, Result};

/// Splitfile redundancy scheme, by its metadata id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitfileAlgorithm {
    /// No check blocks at all
    NonRedundant,
    /// Systematic Reed-Solomon over each segment
    OnionStandard,
}

impl SplitfileAlgorithm {
    /// Numeric id stored in metadata and progress records
    pub fn id(self) -> i16 {
        match self {
            SplitfileAlgorithm::NonRedundant => 0,
            SplitfileAlgorithm::OnionStandard => 1,
        }
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SplitfileAlgorithm::NonRedundant),
            1 => Some(SplitfileAlgorithm::OnionStandard),
            _ => None,
        }
    }

    /// Number of check blocks for a segment of `data_blocks` data blocks,
    /// given the target data/check segment sizes.
    pub fn check_blocks_for(
        self,
        data_blocks: usize,
        segment_size: i32,
        check_segment_size: i32,
    ) -> usize {
        match self {
            SplitfileAlgorithm::NonRedundant => 0,
            SplitfileAlgorithm::OnionStandard => {
                if data_blocks == 0 {
                    return 0;
                }
                let check_target = usize::try_from(check_segment_size).unwrap_or(0);
                let data_target = usize::try_from(segment_size)
                    .ok()
                    .filter(|&s| s > 0)
                    .unwrap_or(data_blocks);
                let proportional = data_blocks * check_target / data_target;
                proportional.max(1).min(check_target.max(1))
            }
        }
    }
}

impl fmt::Display for SplitfileAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitfileAlgorithm::NonRedundant => write!(f, "non-redundant"),
            SplitfileAlgorithm::OnionStandard => write!(f, "onion-standard"),
        }
    }
}

/// Shape of one segment's encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecParams {
    /// Number of data blocks
    pub data_blocks: usize,
    /// Number of check blocks
    pub check_blocks: usize,
    /// Size of each block in bytes
    pub block_size: usize,
}

impl FecParams {
    /// Create new FEC parameters
    ///
    /// The Reed-Solomon block limit only binds segments that carry check
    /// blocks; an unprotected segment may hold any number of data blocks.
    pub fn new(data_blocks: usize, check_blocks: usize) -> Result<Self> {
        let coded = check_blocks > 0;
        if coded && (data_blocks > MAX_BLOCKS_PER_SEGMENT || check_blocks > MAX_BLOCKS_PER_SEGMENT)
        {
            return Err(FecError::InvalidParameters {
                data: data_blocks,
                check: check_blocks,
            });
        }
        if check_blocks > 0 && data_blocks == 0 {
            return Err(FecError::InvalidParameters {
                data: data_blocks,
                check: check_blocks,
            });
        }

        Ok(Self {
            data_blocks,
            check_blocks,
            block_size: CHK_BLOCK_SIZE,
        })
    }

    /// Get total number of blocks
    pub fn total_blocks(&self) -> usize {
        self.data_blocks + self.check_blocks
    }

    /// Calculate storage overhead ratio
    pub fn overhead_ratio(&self) -> f64 {
        if self.data_blocks == 0 {
            return 1.0;
        }
        self.total_blocks() as f64 / self.data_blocks as f64
    }
}

impl fmt::Display for FecParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FEC({}/{}, {}KB blocks)",
            self.data_blocks,
            self.total_blocks(),
            self.block_size / 1024
        )
    }
}

/// Redundancy scheme instance sized for one segment
#[derive(Debug, Clone)]
pub struct FecCodec {
    algorithm: SplitfileAlgorithm,
    params: FecParams,
    backend: Arc<dyn FecBackend>,
}

impl FecCodec {
    /// Select the codec for a segment of `data_blocks` data blocks
    pub fn for_segment(
        algorithm: SplitfileAlgorithm,
        data_blocks: usize,
        segment_size: i32,
        check_segment_size: i32,
    ) -> Result<Self> {
        let check_blocks = algorithm.check_blocks_for(data_blocks, segment_size, check_segment_size);
        let params = FecParams::new(data_blocks, check_blocks)?;
        Ok(Self::with_backend(algorithm, params, backends::create_backend()))
    }

    /// Create with specific backend
    pub fn with_backend(
        algorithm: SplitfileAlgorithm,
        params: FecParams,
        backend: Arc<dyn FecBackend>,
    ) -> Self {
        Self {
            algorithm,
            params,
            backend,
        }
    }

    pub fn algorithm(&self) -> SplitfileAlgorithm {
        self.algorithm
    }

    pub fn params(&self) -> FecParams {
        self.params
    }

    pub fn data_blocks(&self) -> usize {
        self.params.data_blocks
    }

    pub fn check_blocks(&self) -> usize {
        self.params.check_blocks
    }

    /// Compute the check blocks of a segment
    ///
    /// Data blocks shorter than the block size are zero-padded first; the
    /// returned check blocks are always full-sized.
    pub fn encode<B: AsRef<[u8]>>(&self, data: &[B]) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.params.data_blocks {
            return Err(FecError::SizeMismatch {
                expected: self.params.data_blocks,
                actual: data.len(),
            });
        }
        if self.params.check_blocks == 0 {
            return Ok(Vec::new());
        }

        let padded = self.pad_blocks(data.iter().map(|b| b.as_ref()))?;
        let refs: Vec<&[u8]> = padded.iter().map(|b| b.as_slice()).collect();

        debug!(
            "Encoding {} with {} backend",
            self.params,
            self.backend.name()
        );
        self.backend.encode_blocks(&refs, self.params.check_blocks)
    }

    /// Restore missing data blocks (padded to full size) from survivors
    pub fn decode(
        &self,
        data: &mut [Option<Vec<u8>>],
        check: &[Option<Vec<u8>>],
    ) -> Result<()> {
        if data.len() != self.params.data_blocks || check.len() != self.params.check_blocks {
            return Err(FecError::SizeMismatch {
                expected: self.params.total_blocks(),
                actual: data.len() + check.len(),
            });
        }
        for block in data.iter_mut().flatten() {
            if block.len() > self.params.block_size {
                return Err(FecError::SizeMismatch {
                    expected: self.params.block_size,
                    actual: block.len(),
                });
            }
            block.resize(self.params.block_size, 0);
        }
        self.backend.decode_blocks(data, check)
    }

    fn pad_blocks<'a>(&self, blocks: impl Iterator<Item = &'a [u8]>) -> Result<Vec<Vec<u8>>> {
        let block_size = self.params.block_size;
        blocks
            .map(|block| {
                if block.len() > block_size {
                    return Err(FecError::SizeMismatch {
                        expected: block_size,
                        actual: block.len(),
                    });
                }
                let mut padded = vec![0u8; block_size];
                padded[..block.len()].copy_from_slice(block);
                Ok(padded)
            })
            .collect()
    }
}
