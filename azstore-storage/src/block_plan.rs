// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::ops::Range;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::{StorageErrorKind, StorageResult};

/// Below this block size, splitting a payload further does not pay for the
/// extra requests.
pub const MIN_BLOCK_NUM_BYTES: u64 = 32 * 1024 * 1024;
/// Service cap on a single block.
pub const MAX_BLOCK_NUM_BYTES: u64 = 4_000 * 1024 * 1024;
/// Service cap on the number of blocks of one blob.
pub const MAX_NUM_BLOCKS: u64 = 50_000;

fn div_ceil(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator - 1) / denominator
}

/// The static partition of one upload: how many blocks, which byte range
/// each covers, and the block ids to commit, in order.
#[derive(Debug, Clone)]
pub struct BlockPlan {
    num_bytes: u64,
    block_ids: Vec<String>,
}

impl BlockPlan {
    /// Computes the partition of `num_bytes` over at most
    /// `max_block_num_bytes`-sized blocks, widening the block count to
    /// `num_threads` when the payload is large enough to keep every worker
    /// busy with at least [`MIN_BLOCK_NUM_BYTES`].
    pub fn compute(
        num_bytes: u64,
        num_threads: usize,
        max_block_num_bytes: Option<u64>,
    ) -> StorageResult<BlockPlan> {
        let block_cap = max_block_num_bytes
            .unwrap_or(MAX_BLOCK_NUM_BYTES)
            .min(MAX_BLOCK_NUM_BYTES);
        let mut num_blocks = div_ceil(num_bytes.max(1), block_cap);
        if num_blocks < num_threads as u64 {
            num_blocks =
                div_ceil(num_bytes.max(1), MIN_BLOCK_NUM_BYTES).clamp(1, num_threads as u64);
        }
        if num_blocks > MAX_NUM_BLOCKS {
            return Err(StorageErrorKind::PayloadTooLarge.with_error(anyhow::anyhow!(
                "{num_bytes} bytes cannot fit in {MAX_NUM_BLOCKS} blocks of at most {block_cap} \
                 bytes"
            )));
        }
        let width = block_id_width(num_blocks);
        let block_ids = (0..num_blocks)
            .map(|block_idx| BASE64.encode(format!("{block_idx:0width$}")))
            .collect();
        Ok(BlockPlan {
            num_bytes,
            block_ids,
        })
    }

    /// Total payload size covered by the plan.
    pub fn num_bytes(&self) -> u64 {
        self.num_bytes
    }

    /// Number of blocks of the plan.
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Block ids in commit order.
    pub fn block_ids(&self) -> &[String] {
        &self.block_ids
    }

    /// Byte range of block `block_idx`. The first `num_bytes % num_blocks`
    /// blocks are one byte larger, so sizes never differ by more than one.
    pub fn block_range(&self, block_idx: usize) -> Range<u64> {
        partition_range(self.num_bytes, self.block_ids.len() as u64, block_idx as u64)
    }

    /// Size of the largest block; the first block is never smaller than
    /// any other.
    pub fn max_block_num_bytes(&self) -> u64 {
        self.block_range(0).end
    }
}

/// Decimal width of the zero-padded block index: the base64-decoded ids
/// must sort lexicographically in numeric order.
fn block_id_width(num_blocks: u64) -> usize {
    if num_blocks <= 1 {
        1
    } else {
        (num_blocks - 1).ilog10() as usize + 1
    }
}

/// Byte range of part `part_idx` in the near-equal partition of
/// `num_bytes` over `num_parts`.
pub fn partition_range(num_bytes: u64, num_parts: u64, part_idx: u64) -> Range<u64> {
    let base = num_bytes / num_parts;
    let remainder = num_bytes % num_parts;
    let start = part_idx * base + part_idx.min(remainder);
    let end = start + base + u64::from(part_idx < remainder);
    start..end
}
