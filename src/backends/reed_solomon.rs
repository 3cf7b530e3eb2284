// Copyright 2024 Saorsa Labs
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Reed-Solomon backend built on `reed-solomon-simd`

use crate::{FecBackend, FecError, Result};

/// Upper bound on data or check blocks per segment accepted by the codec
pub const MAX_BLOCKS_PER_SEGMENT: usize = 32768;

/// Systematic Reed-Solomon backend
#[derive(Debug, Default)]
pub struct ReedSolomonBackend;

impl ReedSolomonBackend {
    pub fn new() -> Self {
        Self
    }

    fn check_block_size(data: &[&[u8]]) -> Result<usize> {
        let block_size = data.first().map(|b| b.len()).unwrap_or(0);
        if block_size == 0 || block_size % 2 != 0 {
            return Err(FecError::SizeMismatch {
                expected: block_size.max(2).next_multiple_of(2),
                actual: block_size,
            });
        }
        for block in data {
            if block.len() != block_size {
                return Err(FecError::SizeMismatch {
                    expected: block_size,
                    actual: block.len(),
                });
            }
        }
        Ok(block_size)
    }
}

impl FecBackend for ReedSolomonBackend {
    fn encode_blocks(&self, data: &[&[u8]], check_count: usize) -> Result<Vec<Vec<u8>>> {
        if data.is_empty()
            || check_count == 0
            || data.len() > MAX_BLOCKS_PER_SEGMENT
            || check_count > MAX_BLOCKS_PER_SEGMENT
        {
            return Err(FecError::InvalidParameters {
                data: data.len(),
                check: check_count,
            });
        }
        Self::check_block_size(data)?;

        reed_solomon_simd::encode(data.len(), check_count, data.iter())
            .map_err(|e| FecError::Backend(e.to_string()))
    }

    fn decode_blocks(&self, data: &mut [Option<Vec<u8>>], check: &[Option<Vec<u8>>]) -> Result<()> {
        let missing: Vec<usize> = (0..data.len()).filter(|&i| data[i].is_none()).collect();
        if missing.is_empty() {
            return Ok(());
        }

        let have = data.len() - missing.len() + check.iter().filter(|c| c.is_some()).count();
        if have < data.len() {
            return Err(FecError::InsufficientBlocks {
                have,
                need: data.len(),
            });
        }

        let originals: Vec<(usize, &Vec<u8>)> = data
            .iter()
            .enumerate()
            .filter_map(|(i, block)| block.as_ref().map(|b| (i, b)))
            .collect();
        let recovery: Vec<(usize, &Vec<u8>)> = check
            .iter()
            .enumerate()
            .filter_map(|(i, block)| block.as_ref().map(|b| (i, b)))
            .collect();

        let mut restored = reed_solomon_simd::decode(data.len(), check.len(), originals, recovery)
            .map_err(|e| FecError::Backend(e.to_string()))?;

        for index in missing {
            let block = restored
                .remove(&index)
                .ok_or(FecError::InsufficientBlocks {
                    have,
                    need: data.len(),
                })?;
            data[index] = Some(block);
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "reed-solomon-simd"
    }
}
