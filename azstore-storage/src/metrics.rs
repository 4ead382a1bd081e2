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

// See https://prometheus.io/docs/practices/naming/

use azstore_common::metrics::{new_counter, IntCounter};
use once_cell::sync::Lazy;

/// Counters associated to storage operations.
pub struct StorageMetrics {
    pub object_storage_get_total: IntCounter,
    pub object_storage_put_total: IntCounter,
    pub object_storage_put_parts: IntCounter,
    pub object_storage_download_num_bytes: IntCounter,
    pub object_storage_upload_num_bytes: IntCounter,
}

impl Default for StorageMetrics {
    fn default() -> Self {
        StorageMetrics {
            object_storage_get_total: new_counter(
                "object_storage_gets_total",
                "Number of blobs fetched.",
                "azstore_storage",
            ),
            object_storage_put_total: new_counter(
                "object_storage_puts_total",
                "Number of blobs uploaded. May differ from object_storage_puts_parts due to \
                 the block upload protocol.",
                "azstore_storage",
            ),
            object_storage_put_parts: new_counter(
                "object_storage_puts_parts",
                "Number of blob blocks uploaded.",
                "azstore_storage",
            ),
            object_storage_download_num_bytes: new_counter(
                "object_storage_download_num_bytes",
                "Amount of data downloaded from the object storage.",
                "azstore_storage",
            ),
            object_storage_upload_num_bytes: new_counter(
                "object_storage_upload_num_bytes",
                "Amount of data uploaded to the object storage.",
                "azstore_storage",
            ),
        }
    }
}

/// Storage counters exposed through a prometheus endpoint.
pub static STORAGE_METRICS: Lazy<StorageMetrics> = Lazy::new(StorageMetrics::default);
