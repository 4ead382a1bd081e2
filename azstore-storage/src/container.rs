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

use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use azstore_auth::AuthSession;
use azstore_common::retry::{retry, RetryParams};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::header::{HeaderName, CONTENT_TYPE, RANGE};
use reqwest::{Method, Url};
use tracing::{debug, instrument, warn};

use crate::block_plan::{partition_range, BlockPlan, MIN_BLOCK_NUM_BYTES};
use crate::metrics::STORAGE_METRICS;
use crate::transport::{headers, RequestError, Transport, TransportErrorKind};
use crate::{ignore_error_kind, xml, PutPayload, StorageError, StorageErrorKind, StorageResult};

/// Content type of binary writes.
pub const OCTET_STREAM: &str = "application/octet-stream";
/// Content type of string writes.
pub const TEXT_PLAIN: &str = "text/plain";

const INVALID_BLOCK_LIST: &str = "InvalidBlockList";

/// Per-handle transfer behavior. Two handles with different configs still
/// compare equal: only `{account, container, prefix}` identify a handle.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Upper bound on in-flight requests within one upload or download.
    pub num_threads: usize,
    /// Deadline for establishing the TCP+TLS connection.
    pub connect_timeout: Duration,
    /// A request through which no byte moves for this long is aborted and
    /// retried.
    pub read_timeout: Duration,
    /// Backoff schedule; `max_attempts` counts the first try.
    pub retry_params: RetryParams,
    /// Optional cap on the size of one uploaded block.
    pub max_block_num_bytes: Option<u64>,
    /// Total buffer of the double-buffered file copy pipeline.
    pub copy_buffer_num_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            num_threads: num_cpus::get(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            retry_params: RetryParams::default(),
            max_block_num_bytes: None,
            copy_buffer_num_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// A handle on one container of one storage account, optionally scoped to
/// a virtual directory prefix.
#[derive(Clone)]
pub struct AzureContainer {
    storage_account: String,
    container_name: String,
    prefix: String,
    endpoint: String,
    transport: Transport,
    config: TransferConfig,
}

impl fmt::Debug for AzureContainer {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter
            .debug_struct("AzureContainer")
            .field("storage_account", &self.storage_account)
            .field("container_name", &self.container_name)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl PartialEq for AzureContainer {
    fn eq(&self, other: &Self) -> bool {
        self.storage_account == other.storage_account
            && self.container_name == other.container_name
            && self.prefix == other.prefix
    }
}

impl Eq for AzureContainer {}

impl AzureContainer {
    /// Creates a container handle. A `container_name` holding `/` is split
    /// at the first separator: the head is the container, the tail joins
    /// the prefix.
    pub fn new(
        storage_account: &str,
        container_name: &str,
        session: AuthSession,
        config: TransferConfig,
    ) -> StorageResult<Self> {
        let (container_name, extra_prefix) = match container_name.split_once('/') {
            Some((head, tail)) => (head.to_string(), normalize_path(tail)),
            None => (container_name.to_string(), String::new()),
        };
        let mut config = config;
        if config.num_threads == 0 {
            warn!("A zero thread budget is not usable, forcing single-request transfers");
            config.num_threads = 1;
        }
        let transport = Transport::new(session, config.connect_timeout, config.read_timeout)?;
        Ok(AzureContainer {
            storage_account: storage_account.to_string(),
            container_name,
            prefix: extra_prefix,
            endpoint: format!("https://{storage_account}.blob.core.windows.net"),
            transport,
            config,
        })
    }

    /// Builds a handle from an `azure://account/container[/prefix]` URI.
    pub fn from_uri(
        uri: &str,
        session: AuthSession,
        config: TransferConfig,
    ) -> StorageResult<Self> {
        let (storage_account, container_name, prefix) = parse_azure_uri(uri).ok_or_else(|| {
            StorageErrorKind::InternalError.with_error(anyhow::anyhow!("Invalid URI: {uri}"))
        })?;
        let container = AzureContainer::new(&storage_account, &container_name, session, config)?;
        Ok(container.with_prefix(&prefix))
    }

    /// Prepends `prefix` to the handle's virtual directory.
    pub fn with_prefix(self, prefix: &str) -> Self {
        let prefix = add_prefix(&normalize_path(prefix), &self.prefix);
        Self { prefix, ..self }
    }

    /// Points the handle at another endpoint, e.g. a local emulator.
    pub fn with_endpoint(self, endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            ..self
        }
    }

    /// The storage account this handle addresses.
    pub fn storage_account(&self) -> &str {
        &self.storage_account
    }

    /// The container name, without any prefix remainder.
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// The virtual directory prepended to every blob name.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The container-relative directory this handle addresses, e.g.
    /// `"ct-b/p"` for container `ct-b` with prefix `p`.
    pub fn dirname(&self) -> String {
        if self.prefix.is_empty() {
            self.container_name.clone()
        } else {
            format!("{}/{}", self.container_name, self.prefix)
        }
    }

    /// The `azure://` URI of the handle's scope.
    pub fn uri(&self) -> String {
        format!(
            "azure://{}/{}",
            self.storage_account,
            self.dirname()
        )
    }

    /// The OAuth2 session shared by every transfer of this handle.
    pub fn session(&self) -> &AuthSession {
        self.transport.session()
    }

    pub(crate) fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Full blob name: the handle prefix joined with `name`.
    pub(crate) fn full_blob_name(&self, name: &str) -> String {
        add_prefix(&self.prefix, name)
    }

    fn account_url(&self) -> StorageResult<Url> {
        Url::parse(&format!("{}/", self.endpoint))
            .map_err(|error| StorageErrorKind::InternalError.with_error(error))
    }

    fn container_url(&self) -> StorageResult<Url> {
        let mut url = self.account_url()?;
        url.path_segments_mut()
            .map_err(|()| {
                StorageErrorKind::InternalError
                    .with_error(anyhow::anyhow!("Endpoint cannot be a base URL"))
            })?
            .pop_if_empty()
            .push(&self.container_name);
        Ok(url)
    }

    fn blob_url(&self, full_name: &str) -> StorageResult<Url> {
        let mut url = self.container_url()?;
        url.path_segments_mut()
            .map_err(|()| {
                StorageErrorKind::InternalError
                    .with_error(anyhow::anyhow!("Endpoint cannot be a base URL"))
            })?
            .extend(full_name.split('/'));
        Ok(url)
    }

    async fn send_with_retry(
        &self,
        method: Method,
        url: Url,
        extra_headers: Vec<(HeaderName, String)>,
        body: Option<Bytes>,
    ) -> Result<crate::transport::HttpResponse, RequestError> {
        retry(&self.config.retry_params, || {
            let method = method.clone();
            let url = url.clone();
            let extra_headers = extra_headers.clone();
            let body = body.clone();
            async move { self.transport.request(method, url, extra_headers, body).await }
        })
        .await
    }

    // ---- container verbs ----------------------------------------------

    /// Creates the container. Already existing is not an error.
    pub async fn create(&self) -> StorageResult<()> {
        let mut url = self.container_url()?;
        url.query_pairs_mut().append_pair("restype", "container");
        match self.send_with_retry(Method::PUT, url, Vec::new(), None).await {
            Ok(_) => Ok(()),
            Err(error) if error.status_code() == Some(409) => Ok(()),
            Err(error) => Err(StorageError::from(error)
                .add_context(format!("Failed to create container {}", self.container_name))),
        }
    }

    /// Whether the container itself exists.
    pub async fn exists(&self) -> StorageResult<bool> {
        let mut url = self.container_url()?;
        url.query_pairs_mut().append_pair("restype", "container");
        match self.send_with_retry(Method::GET, url, Vec::new(), None).await {
            Ok(_) => Ok(true),
            Err(error) if error.status_code() == Some(404) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Removes the handle's scope: without a prefix the whole container is
    /// deleted; with a prefix only the blobs under it are, and the
    /// container itself goes away only if nothing else is left in it.
    pub async fn remove(&self) -> StorageResult<()> {
        if self.prefix.is_empty() {
            return self.delete_container().await;
        }
        let full_names = self.list_blobs_full(&self.prefix).await?;
        let mut delete_stream = futures::stream::iter(full_names.into_iter().map(|full_name| {
            async move { self.delete_blob_full(&full_name).await }
        }))
        .buffer_unordered(100);
        while let Some(delete_res) = delete_stream.next().await {
            delete_res?;
        }
        let remaining = self.list_blobs_full("").await?;
        if remaining.is_empty() {
            self.delete_container().await?;
        }
        Ok(())
    }

    async fn delete_container(&self) -> StorageResult<()> {
        let mut url = self.container_url()?;
        url.query_pairs_mut().append_pair("restype", "container");
        let delete_res = self
            .send_with_retry(Method::DELETE, url, Vec::new(), None)
            .await
            .map(|_| ())
            .map_err(StorageError::from);
        ignore_error_kind!(StorageErrorKind::DoesNotExist, delete_res)?;
        Ok(())
    }

    /// Lists the containers of the storage account.
    pub async fn list_containers(&self) -> StorageResult<Vec<String>> {
        let mut container_names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.account_url()?;
            url.query_pairs_mut().append_pair("comp", "list");
            if let Some(marker) = &marker {
                url.query_pairs_mut().append_pair("marker", marker);
            }
            let response = self.send_with_retry(Method::GET, url, Vec::new(), None).await?;
            let page = xml::parse_container_list_page(&response.body)?;
            container_names.extend(
                page.containers
                    .containers
                    .into_iter()
                    .map(|container| container.name),
            );
            marker = xml::continuation_marker(page.next_marker);
            if marker.is_none() {
                break;
            }
        }
        Ok(container_names)
    }

    /// Lists the blobs under the handle's prefix. With `strip_prefix`, the
    /// returned names are relative to the prefix; otherwise they are the
    /// full container-level names.
    pub async fn list_blobs(&self, strip_prefix: bool) -> StorageResult<Vec<String>> {
        let full_names = self.list_blobs_full(&self.prefix).await?;
        if !strip_prefix || self.prefix.is_empty() {
            return Ok(full_names);
        }
        let prefix_slash = format!("{}/", self.prefix);
        Ok(full_names
            .into_iter()
            .map(|full_name| {
                full_name
                    .strip_prefix(&prefix_slash)
                    .map(str::to_string)
                    .unwrap_or(full_name)
            })
            .collect())
    }

    async fn list_blobs_full(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut blob_names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut url = self.container_url()?;
            url.query_pairs_mut()
                .append_pair("restype", "container")
                .append_pair("comp", "list");
            if !prefix.is_empty() {
                url.query_pairs_mut().append_pair("prefix", prefix);
            }
            if let Some(marker) = &marker {
                url.query_pairs_mut().append_pair("marker", marker);
            }
            let response = self.send_with_retry(Method::GET, url, Vec::new(), None).await?;
            let page = xml::parse_blob_list_page(&response.body)?;
            blob_names.extend(page.blobs.blobs.into_iter().map(|blob| blob.name));
            marker = xml::continuation_marker(page.next_marker);
            if marker.is_none() {
                break;
            }
        }
        Ok(blob_names)
    }

    // ---- blob verbs ---------------------------------------------------

    /// Whether the blob exists, probed with the same `HEAD` request shape
    /// as [`Self::blob_num_bytes`]. 404 is a plain `false`; anything else
    /// propagates.
    pub async fn blob_exists(&self, name: &str) -> StorageResult<bool> {
        let url = self.blob_url(&self.full_blob_name(name))?;
        match self.send_with_retry(Method::HEAD, url, Vec::new(), None).await {
            Ok(_) => Ok(true),
            Err(error) if error.status_code() == Some(404) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Size of the blob in bytes, read from a `HEAD` request.
    pub async fn blob_num_bytes(&self, name: &str) -> StorageResult<u64> {
        let full_name = self.full_blob_name(name);
        let url = self.blob_url(&full_name)?;
        let response = self
            .send_with_retry(Method::HEAD, url, Vec::new(), None)
            .await
            .map_err(|error| {
                StorageError::from(error)
                    .add_context(format!("Failed to stat blob {}", self.uri_of(&full_name)))
            })?;
        response.header_u64("content-length").ok_or_else(|| {
            StorageErrorKind::Service
                .with_error(anyhow::anyhow!("The HEAD response carried no Content-Length"))
        })
    }

    /// Deletes the blob. Deleting an absent blob is not an error.
    pub async fn delete_blob(&self, name: &str) -> StorageResult<()> {
        self.delete_blob_full(&self.full_blob_name(name)).await
    }

    async fn delete_blob_full(&self, full_name: &str) -> StorageResult<()> {
        let url = self.blob_url(full_name)?;
        let delete_res = self
            .send_with_retry(Method::DELETE, url, Vec::new(), None)
            .await
            .map(|_| ())
            .map_err(StorageError::from);
        ignore_error_kind!(StorageErrorKind::DoesNotExist, delete_res)?;
        Ok(())
    }

    /// Server-side copy into `dst_container`, without moving the bytes
    /// through this client.
    pub async fn copy_blob(
        &self,
        src_name: &str,
        dst_container: &AzureContainer,
        dst_name: &str,
    ) -> StorageResult<()> {
        let src_url = self.blob_url(&self.full_blob_name(src_name))?;
        let dst_url = dst_container.blob_url(&dst_container.full_blob_name(dst_name))?;
        let copy_headers = vec![(
            HeaderName::from_static(headers::X_MS_COPY_SOURCE),
            src_url.to_string(),
        )];
        self.send_with_retry(Method::PUT, dst_url, copy_headers, None)
            .await
            .map_err(|error| {
                StorageError::from(error)
                    .add_context(format!("Failed to copy blob {src_name} to {dst_name}"))
            })?;
        Ok(())
    }

    /// Uploads `payload` as the blob `name`, overwriting any previous
    /// content. Large payloads go through the parallel block protocol.
    pub async fn put(&self, name: &str, payload: PutPayload) -> StorageResult<()> {
        self.put_with_content_type(name, payload, OCTET_STREAM).await
    }

    /// Uploads a string blob with a text content type.
    pub async fn put_text(&self, name: &str, text: &str) -> StorageResult<()> {
        let payload = PutPayload::from(text.as_bytes().to_vec());
        self.put_with_content_type(name, payload, TEXT_PLAIN).await
    }

    /// Creates an empty marker blob holding a single NUL byte. A zero-byte
    /// blob would be indistinguishable from an absent one on some query
    /// paths.
    pub async fn touch(&self, name: &str) -> StorageResult<()> {
        self.put(name, PutPayload::from(vec![0u8])).await
    }

    /// Uploads `payload` with an explicit content type.
    pub async fn put_with_content_type(
        &self,
        name: &str,
        payload: PutPayload,
        content_type: &str,
    ) -> StorageResult<()> {
        STORAGE_METRICS.object_storage_put_total.inc();
        let full_name = self.full_blob_name(name);
        let total_num_bytes = payload.len().await?;
        let plan = BlockPlan::compute(
            total_num_bytes,
            self.config.num_threads,
            self.config.max_block_num_bytes,
        )?;
        let upload_res = if plan.num_blocks() == 1 || self.config.num_threads == 1 {
            self.put_single_shot(&full_name, &payload, content_type).await
        } else {
            self.upload_blocks(&full_name, &payload, &plan, 0..plan.num_blocks(), 0)
                .await?;
            self.commit_block_list(&full_name, &plan).await
        };
        upload_res.map_err(|error| {
            error.add_context(format!("Failed to upload blob {}", self.uri_of(&full_name)))
        })
    }

    /// Single-request upload: the whole payload in one `PUT`, no block
    /// protocol, no commit.
    async fn put_single_shot(
        &self,
        full_name: &str,
        payload: &PutPayload,
        content_type: &str,
    ) -> StorageResult<()> {
        let url = self.blob_url(full_name)?;
        let total_num_bytes = payload.len().await?;
        STORAGE_METRICS.object_storage_put_parts.inc();
        STORAGE_METRICS
            .object_storage_upload_num_bytes
            .inc_by(total_num_bytes);
        retry(&self.config.retry_params, || {
            let url = url.clone();
            let payload = payload.clone();
            async move {
                let data = payload
                    .range_bytes(0..total_num_bytes)
                    .await
                    .map_err(payload_read_error)?;
                let content_md5 = BASE64.encode(md5::compute(&data[..]).0);
                let put_headers = vec![
                    (
                        HeaderName::from_static(headers::X_MS_BLOB_TYPE),
                        "BlockBlob".to_string(),
                    ),
                    (CONTENT_TYPE, content_type.to_string()),
                    (HeaderName::from_static("content-md5"), content_md5),
                ];
                self.transport
                    .request(Method::PUT, url, put_headers, Some(data))
                    .await?;
                Ok::<(), RequestError>(())
            }
        })
        .await
        .map_err(StorageError::from)
    }

    /// Uploads the blocks `block_indices` of `plan`. `payload_offset` is
    /// the position of `payload[0]` within the whole blob, so a payload
    /// holding only a batch of blocks can be addressed with plan ranges.
    pub(crate) async fn upload_blocks(
        &self,
        full_name: &str,
        payload: &PutPayload,
        plan: &BlockPlan,
        block_indices: Range<usize>,
        payload_offset: u64,
    ) -> StorageResult<()> {
        let blob_url = self.blob_url(full_name)?;
        let block_results: Vec<Result<(), RequestError>> =
            tokio_stream::iter(block_indices.map(|block_idx| {
                let block_id = &plan.block_ids()[block_idx];
                let block_range = plan.block_range(block_idx);
                let mut block_url = blob_url.clone();
                block_url
                    .query_pairs_mut()
                    .append_pair("comp", "block")
                    .append_pair("blockid", block_id);
                STORAGE_METRICS.object_storage_put_parts.inc();
                STORAGE_METRICS
                    .object_storage_upload_num_bytes
                    .inc_by(block_range.end - block_range.start);
                let payload = payload.clone();
                async move {
                    retry(&self.config.retry_params, || {
                        let block_url = block_url.clone();
                        let payload = payload.clone();
                        let read_range = (block_range.start - payload_offset)
                            ..(block_range.end - payload_offset);
                        async move {
                            let data = payload
                                .range_bytes(read_range)
                                .await
                                .map_err(payload_read_error)?;
                            let content_md5 = BASE64.encode(md5::compute(&data[..]).0);
                            let block_headers = vec![
                                (CONTENT_TYPE, OCTET_STREAM.to_string()),
                                (HeaderName::from_static("content-md5"), content_md5),
                            ];
                            self.transport
                                .request(Method::PUT, block_url, block_headers, Some(data))
                                .await?;
                            Ok::<(), RequestError>(())
                        }
                    })
                    .await
                }
            }))
            .buffer_unordered(self.config.num_threads)
            .collect()
            .await;
        // Every worker has drained; surface the first failure.
        for block_result in block_results {
            block_result.map_err(StorageError::from)?;
        }
        Ok(())
    }

    /// Commits the block list in plan order. A 400 `InvalidBlockList` may
    /// mean a duplicate commit already won the race; if the committed set
    /// matches the plan, the commit is idempotently successful.
    pub(crate) async fn commit_block_list(
        &self,
        full_name: &str,
        plan: &BlockPlan,
    ) -> StorageResult<()> {
        let body = xml::render_block_list(plan.block_ids())?;
        let mut url = self.blob_url(full_name)?;
        url.query_pairs_mut().append_pair("comp", "blocklist");
        let commit_headers = vec![(CONTENT_TYPE, "application/xml".to_string())];
        let commit_res = self
            .send_with_retry(Method::PUT, url, commit_headers, Some(Bytes::from(body)))
            .await;
        match commit_res {
            Ok(_) => Ok(()),
            Err(error)
                if error.status_code() == Some(400)
                    && error.error_code() == Some(INVALID_BLOCK_LIST) =>
            {
                if self.committed_set_matches(full_name, plan).await {
                    debug!(blob = %full_name, "A concurrent commit of the same block list won the race");
                    Ok(())
                } else {
                    Err(error.into())
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn committed_set_matches(&self, full_name: &str, plan: &BlockPlan) -> bool {
        let committed_ids = match self.committed_block_ids(full_name).await {
            Ok(committed_ids) => committed_ids,
            Err(error) => {
                debug!(blob = %full_name, error = %error, "Failed to fetch the committed block list");
                return false;
            }
        };
        let mut committed_sorted = committed_ids;
        committed_sorted.sort_unstable();
        let mut planned_sorted = plan.block_ids().to_vec();
        planned_sorted.sort_unstable();
        committed_sorted == planned_sorted
    }

    async fn committed_block_ids(&self, full_name: &str) -> StorageResult<Vec<String>> {
        let mut url = self.blob_url(full_name)?;
        url.query_pairs_mut()
            .append_pair("comp", "blocklist")
            .append_pair("blocklisttype", "committed");
        let response = self.send_with_retry(Method::GET, url, Vec::new(), None).await?;
        let block_list = xml::parse_block_list(&response.body)?;
        Ok(block_list
            .committed_blocks
            .blocks
            .into_iter()
            .map(|block| block.name)
            .collect())
    }

    /// Fills `buffer` with the blob bytes starting at `offset`, slicing
    /// the range over up to `num_threads` concurrent range reads.
    #[instrument(level = "debug", skip(self, buffer), fields(num_bytes = buffer.len()))]
    pub async fn read_into(
        &self,
        name: &str,
        buffer: &mut [u8],
        offset: u64,
    ) -> StorageResult<()> {
        STORAGE_METRICS.object_storage_get_total.inc();
        let full_name = self.full_blob_name(name);
        let url = self.blob_url(&full_name)?;
        let num_bytes = buffer.len() as u64;
        if num_bytes == 0 {
            return Ok(());
        }
        let num_parts = (num_bytes / MIN_BLOCK_NUM_BYTES).clamp(1, self.config.num_threads as u64);

        let mut part_slices = Vec::with_capacity(num_parts as usize);
        let mut remaining = buffer;
        for part_idx in 0..num_parts {
            let part_range = partition_range(num_bytes, num_parts, part_idx);
            let (part_slice, tail) = std::mem::take(&mut remaining)
                .split_at_mut((part_range.end - part_range.start) as usize);
            remaining = tail;
            part_slices.push((
                offset + part_range.start..offset + part_range.end,
                part_slice,
            ));
        }
        let range_reads = part_slices
            .into_iter()
            .map(|(blob_range, part_slice)| self.fetch_range(&url, blob_range, part_slice));
        futures::future::try_join_all(range_reads)
            .await
            .map_err(|error| {
                error.add_context(format!("Failed to fetch blob {}", self.uri_of(&full_name)))
            })?;
        Ok(())
    }

    /// Reads the whole blob into memory.
    pub async fn get_all(&self, name: &str) -> StorageResult<Bytes> {
        let num_bytes = self.blob_num_bytes(name).await?;
        let mut buffer = vec![0u8; num_bytes as usize];
        self.read_into(name, &mut buffer, 0).await?;
        Ok(Bytes::from(buffer))
    }

    async fn fetch_range(
        &self,
        url: &Url,
        blob_range: Range<u64>,
        part_slice: &mut [u8],
    ) -> StorageResult<()> {
        let range_header = format!("bytes={}-{}", blob_range.start, blob_range.end - 1);
        let response = retry(&self.config.retry_params, || {
            let url = url.clone();
            let range_header = range_header.clone();
            async move {
                self.transport
                    .request(Method::GET, url, vec![(RANGE, range_header)], None)
                    .await
            }
        })
        .await
        .map_err(StorageError::from)?;
        if response.body.len() != part_slice.len() {
            return Err(StorageErrorKind::Service.with_error(anyhow::anyhow!(
                "Range {range_header} answered with {} bytes instead of {}",
                response.body.len(),
                part_slice.len()
            )));
        }
        part_slice.copy_from_slice(&response.body);
        STORAGE_METRICS
            .object_storage_download_num_bytes
            .inc_by(part_slice.len() as u64);
        Ok(())
    }

    fn uri_of(&self, full_name: &str) -> String {
        format!(
            "azure://{}/{}/{}",
            self.storage_account, self.container_name, full_name
        )
    }
}

/// A blob address: a container handle plus a name. Pure addressing, no
/// open-file state.
#[derive(Clone, Debug)]
pub struct BlobHandle {
    container: Arc<AzureContainer>,
    name: String,
}

#[allow(missing_docs)]
impl BlobHandle {
    pub fn new(container: Arc<AzureContainer>, name: impl Into<String>) -> Self {
        BlobHandle {
            container,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self) -> &AzureContainer {
        &self.container
    }

    pub async fn put(&self, payload: PutPayload) -> StorageResult<()> {
        self.container.put(&self.name, payload).await
    }

    pub async fn get_all(&self) -> StorageResult<Bytes> {
        self.container.get_all(&self.name).await
    }

    pub async fn read_into(&self, buffer: &mut [u8], offset: u64) -> StorageResult<()> {
        self.container.read_into(&self.name, buffer, offset).await
    }

    pub async fn exists(&self) -> StorageResult<bool> {
        self.container.blob_exists(&self.name).await
    }

    pub async fn num_bytes(&self) -> StorageResult<u64> {
        self.container.blob_num_bytes(&self.name).await
    }

    pub async fn delete(&self) -> StorageResult<()> {
        self.container.delete_blob(&self.name).await
    }

    pub async fn touch(&self) -> StorageResult<()> {
        self.container.touch(&self.name).await
    }
}

fn payload_read_error(error: std::io::Error) -> RequestError {
    RequestError::Transport {
        kind: TransportErrorKind::Io,
        source: anyhow::Error::new(error),
    }
}

/// Joins `prefix` and `name`, normalizing separators. An empty prefix
/// leaves the name untouched apart from normalization.
fn add_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        return normalize_path(name);
    }
    if name.is_empty() {
        return normalize_path(prefix);
    }
    normalize_path(&format!("{prefix}/{name}"))
}

/// Rewrites backslashes to forward slashes, drops empty and `.` segments,
/// and resolves `..`.
fn normalize_path(path: &str) -> String {
    let forward = path.replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in forward.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}

/// Splits an `azure://account/container[/prefix]` URI into its parts.
pub fn parse_azure_uri(uri: &str) -> Option<(String, String, String)> {
    // Ex: azure://account/container/prefix.
    static URI_PTN: OnceCell<Regex> = OnceCell::new();
    URI_PTN
        .get_or_init(|| {
            Regex::new(r"azure(\+[^:]+)?://(?P<account>[^/]+)(/(?P<container>[^/]+))(/(?P<path>.+))?")
                .unwrap()
        })
        .captures(uri)
        .and_then(|captures| {
            let account = captures.name("account")?.as_str().to_string();
            let container = captures.name("container")?.as_str().to_string();
            let path = captures
                .name("path")
                .map_or_else(String::new, |path_match| path_match.as_str().to_string());
            Some((account, container, path))
        })
}
