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

//! Double-buffered file transfer: one half of the copy buffer is on the
//! wire while the other half moves through the filesystem.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use azstore_common::{chunk_range, into_u64_range};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::block_plan::BlockPlan;
use crate::container::AzureContainer;
use crate::{PutPayload, StorageErrorKind, StorageResult};

impl AzureContainer {
    /// Uploads a local file as the blob `name`, overlapping filesystem
    /// reads with block uploads. The whole-file block plan is computed
    /// once; each batch commits nothing until every block is in.
    pub async fn upload_file(&self, local_path: &Path, name: &str) -> StorageResult<()> {
        let file_num_bytes = tokio::fs::metadata(local_path).await?.len();
        let plan = Arc::new(BlockPlan::compute(
            file_num_bytes,
            self.config().num_threads,
            self.config().max_block_num_bytes,
        )?);
        if plan.num_blocks() == 1 || self.config().num_threads == 1 {
            return self
                .put(name, PutPayload::LocalFile(local_path.to_path_buf()))
                .await;
        }
        let full_name = self.full_blob_name(name);
        // Each half of the buffer must hold at least one whole block.
        let half_num_bytes =
            (self.config().copy_buffer_num_bytes / 2).max(plan.max_block_num_bytes());

        let mut file = tokio::fs::File::open(local_path).await?;
        let mut in_flight: Option<JoinHandle<StorageResult<()>>> = None;
        let mut batch_start_block = 0;
        while batch_start_block < plan.num_blocks() {
            let batch_end_block = next_batch_end(&plan, batch_start_block, half_num_bytes);
            let batch_offset = plan.block_range(batch_start_block).start;
            let batch_num_bytes = plan.block_range(batch_end_block - 1).end - batch_offset;

            let read_started_at = Instant::now();
            let mut batch_buffer = vec![0u8; batch_num_bytes as usize];
            file.read_exact(&mut batch_buffer).await?;
            debug!(
                read_mb_per_sec = mb_per_sec(batch_num_bytes, read_started_at),
                "Read one copy batch"
            );

            if let Some(upload) = in_flight.take() {
                join_transfer(upload).await?;
            }
            let container = self.clone();
            let task_plan = Arc::clone(&plan);
            let task_name = full_name.clone();
            in_flight = Some(tokio::spawn(async move {
                let write_started_at = Instant::now();
                let payload = PutPayload::from(batch_buffer);
                container
                    .upload_blocks(
                        &task_name,
                        &payload,
                        &task_plan,
                        batch_start_block..batch_end_block,
                        batch_offset,
                    )
                    .await?;
                debug!(
                    write_mb_per_sec = mb_per_sec(batch_num_bytes, write_started_at),
                    "Uploaded one copy batch"
                );
                Ok(())
            }));
            batch_start_block = batch_end_block;
        }
        if let Some(upload) = in_flight.take() {
            join_transfer(upload).await?;
        }
        self.commit_block_list(&full_name, &plan).await
    }

    /// Downloads the blob `name` into a local file, overlapping range
    /// reads with filesystem writes.
    pub async fn download_file(&self, name: &str, local_path: &Path) -> StorageResult<()> {
        let blob_num_bytes = self.blob_num_bytes(name).await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        if blob_num_bytes == 0 {
            file.flush().await?;
            return Ok(());
        }
        let half_num_bytes = (self.config().copy_buffer_num_bytes / 2).max(1);
        let mut batches = chunk_range(0..blob_num_bytes as usize, half_num_bytes as usize)
            .map(into_u64_range);

        let spawn_fetch = |batch: std::ops::Range<u64>| -> JoinHandle<StorageResult<Vec<u8>>> {
            let container = self.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                let read_started_at = Instant::now();
                let batch_num_bytes = batch.end - batch.start;
                let mut buffer = vec![0u8; batch_num_bytes as usize];
                container.read_into(&name, &mut buffer, batch.start).await?;
                debug!(
                    read_mb_per_sec = mb_per_sec(batch_num_bytes, read_started_at),
                    "Fetched one copy batch"
                );
                Ok(buffer)
            })
        };

        let first_batch = batches.next().expect("A non-empty blob has one batch");
        let mut in_flight = spawn_fetch(first_batch);
        for batch in batches {
            let data = join_transfer(in_flight).await?;
            in_flight = spawn_fetch(batch);
            let write_started_at = Instant::now();
            file.write_all(&data).await?;
            debug!(
                write_mb_per_sec = mb_per_sec(data.len() as u64, write_started_at),
                "Wrote one copy batch"
            );
        }
        let data = join_transfer(in_flight).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Largest `batch_end` such that blocks `[batch_start, batch_end)` fit in
/// `half_num_bytes`; always advances by at least one block.
fn next_batch_end(plan: &BlockPlan, batch_start_block: usize, half_num_bytes: u64) -> usize {
    let batch_offset = plan.block_range(batch_start_block).start;
    let mut batch_end_block = batch_start_block + 1;
    while batch_end_block < plan.num_blocks()
        && plan.block_range(batch_end_block).end - batch_offset <= half_num_bytes
    {
        batch_end_block += 1;
    }
    batch_end_block
}

async fn join_transfer<T>(handle: JoinHandle<StorageResult<T>>) -> StorageResult<T> {
    handle
        .await
        .map_err(|join_error| StorageErrorKind::InternalError.with_error(join_error))?
}

fn mb_per_sec(num_bytes: u64, started_at: Instant) -> f64 {
    let elapsed_secs = started_at.elapsed().as_secs_f64().max(f64::EPSILON);
    num_bytes as f64 / (1024.0 * 1024.0) / elapsed_secs
}
