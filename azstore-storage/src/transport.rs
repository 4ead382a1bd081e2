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

use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use azstore_auth::{AuthError, AuthSession};
use azstore_common::retry::Retryable;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use once_cell::sync::OnceCell;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH};
use reqwest::{Method, Url};
use thiserror::Error;

use crate::{StorageError, StorageErrorKind};

/// REST API version attached to every storage request.
pub const API_VERSION: &str = "2021-08-06";

pub mod headers {
    pub const X_MS_VERSION: &str = "x-ms-version";
    pub const X_MS_BLOB_TYPE: &str = "x-ms-blob-type";
    pub const X_MS_COPY_SOURCE: &str = "x-ms-copy-source";
    pub const X_MS_ERROR_CODE: &str = "x-ms-error-code";
}

/// Upload bodies are cut into chunks of this size so the watchdog sees
/// progress at a fine grain.
const BODY_CHUNK_NUM_BYTES: usize = 256 * 1024;

const WATCHDOG_PERIOD: Duration = Duration::from_millis(if cfg!(test) { 10 } else { 1_000 });

/// Classification of a transport-layer failure.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Name resolution failed with a definitive no-such-name answer.
    DnsPermanent,
    /// Name resolution failed for any other reason.
    Dns,
    Connect,
    TlsHandshake,
    Timeout,
    /// The progress watchdog aborted a request through which no byte moved
    /// for the whole read timeout.
    Stalled,
    Send,
    Receive,
    Io,
}

impl TransportErrorKind {
    pub fn is_retryable(self) -> bool {
        self != TransportErrorKind::DnsPermanent
    }
}

/// A non-2xx answer from the service.
#[derive(Debug)]
pub struct ErrorResponse {
    pub status: u16,
    pub error_code: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transport failure ({kind:?}): {source}")]
    Transport {
        kind: TransportErrorKind,
        #[source]
        source: anyhow::Error,
    },
    #[error("service returned status {}", .0.status)]
    Status(Box<ErrorResponse>),
    #[error("could not obtain a bearer token: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid request: {0}")]
    InvalidRequest(#[source] anyhow::Error),
}

impl RequestError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RequestError::Status(response) => Some(response.status),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            RequestError::Status(response) => response.error_code.as_deref(),
            _ => None,
        }
    }

    fn stalled() -> Self {
        RequestError::Transport {
            kind: TransportErrorKind::Stalled,
            source: anyhow::anyhow!("no byte moved within the read timeout"),
        }
    }
}

impl Retryable for RequestError {
    fn is_retryable(&self) -> bool {
        match self {
            RequestError::Transport { kind, .. } => kind.is_retryable(),
            RequestError::Status(response) => matches!(response.status, 429 | 500 | 503),
            RequestError::Auth(_) | RequestError::InvalidRequest(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RequestError::Status(response) => response.retry_after,
            _ => None,
        }
    }
}

impl From<RequestError> for StorageError {
    fn from(error: RequestError) -> StorageError {
        match &error {
            RequestError::Status(response) => match response.status {
                404 => StorageErrorKind::DoesNotExist.with_error(error),
                401 | 403 => StorageErrorKind::Unauthorized.with_error(error),
                _ => StorageErrorKind::Service.with_error(error),
            },
            RequestError::Transport { .. } => StorageErrorKind::Service.with_error(error),
            RequestError::Auth(AuthError::Transport(_)) => {
                StorageErrorKind::Service.with_error(error)
            }
            RequestError::Auth(_) => StorageErrorKind::Unauthorized.with_error(error),
            RequestError::InvalidRequest(_) => StorageErrorKind::InternalError.with_error(error),
        }
    }
}

/// Classifies a reqwest failure by walking its source chain. DNS outcomes
/// are told apart by the resolver message: `EAI_NONAME` renders as
/// "name or service not known" and is the one permanent case.
fn classify_reqwest_error(error: &reqwest::Error) -> TransportErrorKind {
    let chain_message = error_chain_message(error);
    if let Some(kind) = classify_dns_message(&chain_message) {
        return kind;
    }
    if chain_message.contains("tls") || chain_message.contains("certificate") {
        return TransportErrorKind::TlsHandshake;
    }
    if error.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if error.is_connect() {
        return TransportErrorKind::Connect;
    }
    if error.is_body() || error.is_decode() {
        return TransportErrorKind::Receive;
    }
    if error.is_request() {
        return TransportErrorKind::Send;
    }
    TransportErrorKind::Io
}

fn error_chain_message(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message.to_ascii_lowercase()
}

fn classify_dns_message(message: &str) -> Option<TransportErrorKind> {
    if !message.contains("dns error") && !message.contains("failed to lookup address") {
        return None;
    }
    if message.contains("name or service not known") {
        Some(TransportErrorKind::DnsPermanent)
    } else {
        Some(TransportErrorKind::Dns)
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(error: reqwest::Error) -> RequestError {
        let kind = classify_reqwest_error(&error);
        RequestError::Transport {
            kind,
            source: anyhow::Error::new(error),
        }
    }
}

/// A successful (2xx) response, body fully read.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.headers
            .get(name)?
            .to_str()
            .ok()?
            .parse::<u64>()
            .ok()
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// The service error code either comes as a response header or embedded in
/// the XML error document.
fn parse_error_code(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(error_code) = headers
        .get(headers::X_MS_ERROR_CODE)
        .and_then(|value| value.to_str().ok())
    {
        return Some(error_code.to_string());
    }
    static ERROR_CODE_PTN: OnceCell<Regex> = OnceCell::new();
    let pattern = ERROR_CODE_PTN.get_or_init(|| Regex::new("<Code>([^<]+)</Code>").unwrap());
    let body_text = std::str::from_utf8(body).ok()?;
    pattern
        .captures(body_text)
        .map(|captures| captures[1].to_string())
}

/// Issues single authenticated requests with a byte-progress watchdog.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    session: AuthSession,
    read_timeout: Duration,
}

impl Transport {
    pub fn new(
        session: AuthSession,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Transport, StorageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| StorageErrorKind::InternalError.with_error(error))?;
        Ok(Transport {
            client,
            session,
            read_timeout,
        })
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    /// Sends one request. Returns `Ok` for 2xx only; any other status is a
    /// `RequestError::Status` with the `Retry-After` hint and service error
    /// code extracted.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        extra_headers: Vec<(HeaderName, String)>,
        body: Option<Bytes>,
    ) -> Result<HttpResponse, RequestError> {
        let bearer = self.session.bearer().await?;

        let mut header_map = HeaderMap::new();
        header_map.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer}"))
                .map_err(|error| RequestError::InvalidRequest(anyhow::Error::new(error)))?,
        );
        header_map.insert(
            HeaderName::from_static(headers::X_MS_VERSION),
            HeaderValue::from_static(API_VERSION),
        );
        for (header_name, header_value) in extra_headers {
            let header_value = HeaderValue::from_str(&header_value)
                .map_err(|error| RequestError::InvalidRequest(anyhow::Error::new(error)))?;
            header_map.insert(header_name, header_value);
        }

        let progress = Arc::new(AtomicU64::new(0));
        let mut request_builder = self.client.request(method.clone(), url).headers(header_map);
        match body {
            Some(data) => {
                request_builder = request_builder
                    .header(CONTENT_LENGTH, data.len())
                    .body(progress_body(data, Arc::clone(&progress)));
            }
            None if method == Method::PUT || method == Method::POST => {
                request_builder = request_builder.header(CONTENT_LENGTH, 0);
            }
            None => {}
        }

        tokio::select! {
            response = self.execute(request_builder, &progress) => response,
            _ = watchdog(progress.clone(), self.read_timeout) => Err(RequestError::stalled()),
        }
    }

    async fn execute(
        &self,
        request_builder: reqwest::RequestBuilder,
        progress: &AtomicU64,
    ) -> Result<HttpResponse, RequestError> {
        let response = request_builder.send().await?;
        let status = response.status();
        let response_headers = response.headers().clone();

        let mut body = BytesMut::new();
        let mut body_stream = response.bytes_stream();
        while let Some(chunk) = body_stream.next().await {
            let chunk = chunk?;
            progress.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        if !status.is_success() {
            let error_code = parse_error_code(&response_headers, &body);
            return Err(RequestError::Status(Box::new(ErrorResponse {
                status: status.as_u16(),
                error_code,
                retry_after: parse_retry_after(&response_headers),
                body,
            })));
        }
        Ok(HttpResponse {
            status: status.as_u16(),
            headers: response_headers,
            body,
        })
    }
}

/// Streams `data` in chunks, advancing the shared progress counter as the
/// connection consumes them.
fn progress_body(data: Bytes, progress: Arc<AtomicU64>) -> reqwest::Body {
    let chunk_stream = futures::stream::unfold((data, progress), |(mut remaining, progress)| {
        async move {
            if remaining.is_empty() {
                return None;
            }
            let chunk_len = remaining.len().min(BODY_CHUNK_NUM_BYTES);
            let chunk = remaining.split_to(chunk_len);
            progress.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            Some((
                Ok::<_, std::convert::Infallible>(chunk),
                (remaining, progress),
            ))
        }
    });
    reqwest::Body::wrap_stream(chunk_stream)
}

/// Resolves once no byte has moved in either direction for `read_timeout`.
async fn watchdog(progress: Arc<AtomicU64>, read_timeout: Duration) {
    let mut interval = tokio::time::interval(WATCHDOG_PERIOD);
    let mut last_observed = progress.load(Ordering::Relaxed);
    let mut last_progress_at = Instant::now();
    loop {
        interval.tick().await;
        let observed = progress.load(Ordering::Relaxed);
        if observed != last_observed {
            last_observed = observed;
            last_progress_at = Instant::now();
        } else if last_progress_at.elapsed() >= read_timeout {
            return;
        }
    }
}
