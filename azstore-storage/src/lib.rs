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

#![warn(missing_docs)]
#![allow(clippy::bool_assert_comparison)]
#![allow(clippy::len_without_is_empty)]

//! `azstore-storage` is a client for Azure Blob Storage exposing blob
//! containers through POSIX-like verbs (create/list/remove containers;
//! read/write/copy/remove blobs) while delivering throughput via parallel
//! block-level transfer:
//! - large uploads go through the block protocol, committed atomically;
//! - large downloads are sliced into concurrent range reads;
//! - every request is retried with exponential backoff, honoring service
//!   `Retry-After` deadlines;
//! - all workers share one refreshable OAuth2 session.

mod block_plan;
mod container;
mod copy;
mod error;
mod metrics;
mod payload;
mod transport;
mod xml;

pub use azstore_auth::{AuthSession, Credential, SessionConfig};
pub use azstore_common::metrics::PerfCountersSnapshot;
use azstore_common::metrics::TRANSFER_PERF_COUNTERS;
pub use azstore_common::retry::RetryParams;

pub use self::block_plan::{
    BlockPlan, MAX_BLOCK_NUM_BYTES, MAX_NUM_BLOCKS, MIN_BLOCK_NUM_BYTES,
};
pub use self::container::{
    parse_azure_uri, AzureContainer, BlobHandle, TransferConfig, OCTET_STREAM, TEXT_PLAIN,
};
pub use self::error::{StorageError, StorageErrorKind, StorageResult};
pub use self::metrics::STORAGE_METRICS;
pub use self::payload::PutPayload;
pub use self::transport::{TransportErrorKind, API_VERSION};

/// Snapshots the process-global retry wait counters.
pub fn get_perf_counters() -> PerfCountersSnapshot {
    TRANSFER_PERF_COUNTERS.snapshot()
}

/// Zeroes the process-global retry wait counters.
pub fn reset_perf_counters() {
    TRANSFER_PERF_COUNTERS.reset()
}
