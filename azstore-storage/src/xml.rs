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

//! Serde models of the XML documents exchanged with the blob service.

use serde::{Deserialize, Serialize};

use crate::{StorageErrorKind, StorageResult};

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Body of a block-list commit: every block id of the plan, in plan order,
/// as an `<Uncommitted>` element.
#[derive(Debug, Serialize)]
#[serde(rename = "BlockList")]
struct BlockListRequest<'a> {
    #[serde(rename = "Uncommitted")]
    uncommitted: &'a [String],
}

pub fn render_block_list(block_ids: &[String]) -> StorageResult<String> {
    let document = quick_xml::se::to_string(&BlockListRequest {
        uncommitted: block_ids,
    })
    .map_err(|error| StorageErrorKind::InternalError.with_error(error))?;
    Ok(format!("{XML_DECLARATION}{document}"))
}

/// Answer to a `comp=blocklist` query.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockListResponse {
    #[serde(default)]
    pub committed_blocks: BlockGroup,
    #[serde(default)]
    pub uncommitted_blocks: BlockGroup,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockGroup {
    #[serde(rename = "Block", default)]
    pub blocks: Vec<BlockEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockEntry {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

pub fn parse_block_list(body: &[u8]) -> StorageResult<BlockListResponse> {
    parse_document(body)
}

/// One page of a blob listing (`restype=container&comp=list`).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlobListPage {
    #[serde(default)]
    pub blobs: BlobGroup,
    #[serde(default)]
    pub next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlobGroup {
    #[serde(rename = "Blob", default)]
    pub blobs: Vec<BlobEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlobEntry {
    pub name: String,
}

pub fn parse_blob_list_page(body: &[u8]) -> StorageResult<BlobListPage> {
    parse_document(body)
}

/// One page of an account-scope container listing (`comp=list`).
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerListPage {
    #[serde(default)]
    pub containers: ContainerGroup,
    #[serde(default)]
    pub next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContainerGroup {
    #[serde(rename = "Container", default)]
    pub containers: Vec<ContainerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerEntry {
    pub name: String,
}

pub fn parse_container_list_page(body: &[u8]) -> StorageResult<ContainerListPage> {
    parse_document(body)
}

/// The service returns `<NextMarker />` on the last page; both an absent
/// and an empty marker mean the listing is exhausted.
pub fn continuation_marker(next_marker: Option<String>) -> Option<String> {
    next_marker.filter(|marker| !marker.is_empty())
}

fn parse_document<'de, T: Deserialize<'de>>(body: &'de [u8]) -> StorageResult<T> {
    let body_text = std::str::from_utf8(body)
        .map_err(|error| StorageErrorKind::Service.with_error(error))?;
    quick_xml::de::from_str(body_text).map_err(|error| {
        StorageErrorKind::Service
            .with_error(error)
            .add_context("Failed to parse the service XML response")
    })
}
