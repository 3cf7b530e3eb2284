//! Payload splitting and segment partitioning

use bytes::{Bytes, BytesMut};
use std::io;
use std::ops::Range;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Read a payload into consecutive blocks of at most `block_size` bytes
///
/// Every block but the last is exactly `block_size` long. An empty payload
/// yields no blocks. Returns the blocks and the total payload length.
pub async fn split_into_blocks<R>(mut reader: R, block_size: usize) -> io::Result<(Vec<Bytes>, u64)>
where
    R: AsyncRead + Unpin,
{
    if block_size == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "block size must be greater than 0",
        ));
    }

    let mut blocks = Vec::new();
    let mut total: u64 = 0;

    loop {
        let mut block = BytesMut::zeroed(block_size);
        let mut filled = 0;
        while filled < block_size {
            let n = reader.read(&mut block[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        block.truncate(filled);
        total += filled as u64;
        blocks.push(block.freeze());
        if filled < block_size {
            break;
        }
    }

    trace!("Split {} bytes into {} blocks", total, blocks.len());
    Ok((blocks, total))
}

/// Partition `block_count` blocks into segment windows
///
/// A single segment holds every block when segmentation is disabled
/// (`segment_size <= 0`) or when there are fewer blocks than one segment.
/// Otherwise consecutive windows of `segment_size`, the last possibly shorter.
pub fn partition(block_count: usize, segment_size: i32) -> Vec<Range<usize>> {
    let size = match usize::try_from(segment_size) {
        Ok(size) if size > 0 && block_count >= size => size,
        _ => return vec![0..block_count],
    };

    (0..block_count)
        .step_by(size)
        .map(|start| start..(start + size).min(block_count))
        .collect()
}
