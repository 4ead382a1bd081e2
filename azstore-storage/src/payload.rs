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

use std::io;
use std::ops::Range;
use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// The source of bytes for an upload.
///
/// Cloning is cheap; a `LocalFile` payload is reopened per read, so a
/// retried block sees a fresh file handle.
#[derive(Clone, Debug)]
pub enum PutPayload {
    InMemory(Bytes),
    LocalFile(PathBuf),
}

impl PutPayload {
    /// Total length of the payload in bytes.
    pub async fn len(&self) -> io::Result<u64> {
        match self {
            PutPayload::InMemory(data) => Ok(data.len() as u64),
            PutPayload::LocalFile(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Reads `range` of the payload into memory.
    pub async fn range_bytes(&self, range: Range<u64>) -> io::Result<Bytes> {
        match self {
            PutPayload::InMemory(data) => {
                Ok(data.slice(range.start as usize..range.end as usize))
            }
            PutPayload::LocalFile(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(io::SeekFrom::Start(range.start)).await?;
                let mut buf = vec![0u8; (range.end - range.start) as usize];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl From<Vec<u8>> for PutPayload {
    fn from(data: Vec<u8>) -> Self {
        PutPayload::InMemory(Bytes::from(data))
    }
}

impl From<Bytes> for PutPayload {
    fn from(data: Bytes) -> Self {
        PutPayload::InMemory(data)
    }
}

impl From<PathBuf> for PutPayload {
    fn from(path: PathBuf) -> Self {
        PutPayload::LocalFile(path)
    }
}
