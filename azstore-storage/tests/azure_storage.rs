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

// End-to-end suite against an in-process emulation of the blob endpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use azstore_auth::unix_now;
use azstore_common::rand::append_random_suffix;
use azstore_storage::{
    get_perf_counters, AuthSession, AzureContainer, Credential, PutPayload, RetryParams,
    SessionConfig, StorageErrorKind, TransferConfig, API_VERSION,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use wiremock::http::{HeaderName, Method};
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ---- blob service emulation -------------------------------------------

#[derive(Default)]
struct ServiceState {
    containers: BTreeSet<String>,
    /// `container/blob` -> content.
    blobs: BTreeMap<String, Vec<u8>>,
    /// `container/blob` -> committed block ids, in commit order.
    committed: HashMap<String, Vec<String>>,
    /// `container/blob` -> staged (uncommitted) blocks.
    staged: HashMap<String, HashMap<String, Vec<u8>>>,
    /// Blobs whose next commit is applied but still answered with
    /// `InvalidBlockList`, as if a twin commit had won the race.
    race_once: HashSet<String>,
    /// Blobs whose commits are refused with a non-matching committed set.
    race_mismatch: HashSet<String>,
    list_page_size: Option<usize>,
    block_put_count: usize,
    single_put_count: usize,
}

#[derive(Clone)]
struct FakeBlobService {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeBlobService {
    fn new() -> Self {
        FakeBlobService {
            state: Arc::new(Mutex::new(ServiceState::default())),
        }
    }

    async fn start(&self) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(self.clone())
            .mount(&server)
            .await;
        server
    }
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    let header_name: HeaderName = name.try_into().ok()?;
    request
        .headers
        .get(&header_name)
        .map(|values| values.last().to_string())
}

fn parse_commit_ids(body: &str) -> Vec<String> {
    body.split("<Uncommitted>")
        .skip(1)
        .filter_map(|part| part.split("</Uncommitted>").next())
        .map(str::to_string)
        .collect()
}

fn parse_range(range_header: &str) -> Option<(usize, usize)> {
    let (start, end) = range_header.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn invalid_block_list_response() -> ResponseTemplate {
    ResponseTemplate::new(400)
        .insert_header("x-ms-error-code", "InvalidBlockList")
        .set_body_string(
            r#"<?xml version="1.0" encoding="utf-8"?><Error><Code>InvalidBlockList</Code><Message>The specified block list is invalid.</Message></Error>"#,
        )
}

fn blob_list_xml(names: &[String], next_marker: &str) -> String {
    let entries: String = names
        .iter()
        .map(|name| format!("<Blob><Name>{name}</Name></Blob>"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><EnumerationResults><Blobs>{entries}</Blobs><NextMarker>{next_marker}</NextMarker></EnumerationResults>"#
    )
}

fn container_list_xml(names: &[&String]) -> String {
    let entries: String = names
        .iter()
        .map(|name| format!("<Container><Name>{name}</Name></Container>"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><EnumerationResults><Containers>{entries}</Containers><NextMarker /></EnumerationResults>"#
    )
}

fn committed_list_xml(block_ids: &[String]) -> String {
    let entries: String = block_ids
        .iter()
        .map(|block_id| format!("<Block><Name>{block_id}</Name><Size>0</Size></Block>"))
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><BlockList><CommittedBlocks>{entries}</CommittedBlocks></BlockList>"#
    )
}

impl Respond for FakeBlobService {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let bearer_ok = header_value(request, "authorization")
            .map(|value| value.starts_with("Bearer "))
            .unwrap_or(false);
        if !bearer_ok {
            return ResponseTemplate::new(401);
        }
        if header_value(request, "x-ms-version").as_deref() != Some(API_VERSION) {
            return ResponseTemplate::new(400);
        }

        let mut state = self.state.lock().unwrap();
        let query: HashMap<String, String> = request.url.query_pairs().into_owned().collect();
        let trimmed_path = request.url.path().trim_start_matches('/').to_string();

        // Account scope.
        if trimmed_path.is_empty() {
            if query.get("comp").map(String::as_str) == Some("list") {
                let names: Vec<&String> = state.containers.iter().collect();
                return ResponseTemplate::new(200).set_body_string(container_list_xml(&names));
            }
            return ResponseTemplate::new(400);
        }

        let path_parts = trimmed_path
            .split_once('/')
            .map(|(container, blob_name)| (container.to_string(), blob_name.to_string()));
        match path_parts {
            // Container scope.
            None => {
                let container = trimmed_path;
                match (request.method.clone(), query.get("comp").map(String::as_str)) {
                    (Method::Put, None) => {
                        if !state.containers.insert(container) {
                            return ResponseTemplate::new(409);
                        }
                        ResponseTemplate::new(201)
                    }
                    (Method::Delete, None) => {
                        if !state.containers.remove(&container) {
                            return ResponseTemplate::new(404);
                        }
                        let container_slash = format!("{container}/");
                        state.blobs.retain(|key, _| !key.starts_with(&container_slash));
                        ResponseTemplate::new(202)
                    }
                    (Method::Get, Some("list")) => {
                        let prefix = query.get("prefix").cloned().unwrap_or_default();
                        let marker = query.get("marker").cloned().unwrap_or_default();
                        let container_slash = format!("{container}/");
                        let all_names: Vec<String> = state
                            .blobs
                            .keys()
                            .filter_map(|key| key.strip_prefix(&container_slash))
                            .filter(|name| name.starts_with(&prefix))
                            .filter(|name| *name >= marker.as_str())
                            .map(str::to_string)
                            .collect();
                        let page_size = state.list_page_size.unwrap_or(usize::MAX);
                        let page: Vec<String> =
                            all_names.iter().take(page_size).cloned().collect();
                        let next_marker = all_names
                            .get(page_size)
                            .cloned()
                            .unwrap_or_default();
                        ResponseTemplate::new(200)
                            .set_body_string(blob_list_xml(&page, &next_marker))
                    }
                    (Method::Get, None) => {
                        if state.containers.contains(&container) {
                            ResponseTemplate::new(200)
                        } else {
                            ResponseTemplate::new(404)
                        }
                    }
                    _ => ResponseTemplate::new(400),
                }
            }
            // Blob scope.
            Some((container, blob_name)) => {
                let key = format!("{container}/{blob_name}");
                match (request.method.clone(), query.get("comp").map(String::as_str)) {
                    (Method::Put, Some("block")) => {
                        let block_id = query.get("blockid").cloned().unwrap_or_default();
                        state.block_put_count += 1;
                        state
                            .staged
                            .entry(key)
                            .or_default()
                            .insert(block_id, request.body.clone());
                        ResponseTemplate::new(201)
                    }
                    (Method::Put, Some("blocklist")) => {
                        let listed_ids =
                            parse_commit_ids(&String::from_utf8_lossy(&request.body));
                        if state.race_mismatch.contains(&key) {
                            state
                                .committed
                                .insert(key, vec![BASE64.encode("not-the-plan")]);
                            return invalid_block_list_response();
                        }
                        let staged = state.staged.remove(&key).unwrap_or_default();
                        let all_staged =
                            listed_ids.iter().all(|block_id| staged.contains_key(block_id));
                        if !all_staged {
                            // A duplicate commit finds its blocks consumed.
                            state.staged.insert(key, staged);
                            return invalid_block_list_response();
                        }
                        let mut content = Vec::new();
                        for block_id in &listed_ids {
                            content.extend_from_slice(&staged[block_id]);
                        }
                        state.blobs.insert(key.clone(), content);
                        state.committed.insert(key.clone(), listed_ids);
                        if state.race_once.remove(&key) {
                            return invalid_block_list_response();
                        }
                        ResponseTemplate::new(201)
                    }
                    (Method::Get, Some("blocklist")) => {
                        let committed = state.committed.get(&key).cloned().unwrap_or_default();
                        ResponseTemplate::new(200)
                            .set_body_string(committed_list_xml(&committed))
                    }
                    (Method::Put, None) => {
                        if let Some(copy_source) = header_value(request, "x-ms-copy-source") {
                            let source_key = copy_source
                                .split_once("//")
                                .and_then(|(_, tail)| tail.split_once('/'))
                                .map(|(_, source_path)| source_path.to_string())
                                .unwrap_or_default();
                            let Some(content) = state.blobs.get(&source_key).cloned() else {
                                return ResponseTemplate::new(404);
                            };
                            state.blobs.insert(key, content);
                            return ResponseTemplate::new(202);
                        }
                        if header_value(request, "x-ms-blob-type").as_deref() != Some("BlockBlob")
                        {
                            return ResponseTemplate::new(400);
                        }
                        state.single_put_count += 1;
                        state.blobs.insert(key, request.body.clone());
                        ResponseTemplate::new(201)
                    }
                    (Method::Get, None) => {
                        let Some(content) = state.blobs.get(&key) else {
                            return ResponseTemplate::new(404);
                        };
                        match header_value(request, "range").as_deref().and_then(parse_range)
                        {
                            Some((range_start, range_end)) => {
                                if range_end >= content.len() {
                                    return ResponseTemplate::new(416);
                                }
                                ResponseTemplate::new(206)
                                    .set_body_bytes(content[range_start..=range_end].to_vec())
                            }
                            None => {
                                ResponseTemplate::new(200).set_body_bytes(content.clone())
                            }
                        }
                    }
                    (Method::Head, None) => {
                        let Some(content) = state.blobs.get(&key) else {
                            return ResponseTemplate::new(404);
                        };
                        ResponseTemplate::new(200).set_body_bytes(content.clone())
                    }
                    (Method::Delete, None) => {
                        if state.blobs.remove(&key).is_none() {
                            return ResponseTemplate::new(404);
                        }
                        ResponseTemplate::new(202)
                    }
                    _ => ResponseTemplate::new(400),
                }
            }
        }
    }
}

// ---- helpers ----------------------------------------------------------

fn fast_retry_params() -> RetryParams {
    RetryParams {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
        max_attempts: 10,
    }
}

fn static_session() -> AuthSession {
    AuthSession::new(SessionConfig {
        tenant: "contoso".to_string(),
        client_id: "client-1".to_string(),
        credential: Credential::Static,
        scope: None,
        resource: "https://storage.azure.com".to_string(),
        bearer: "test-token".to_string(),
        expiry_unix_secs: u64::MAX,
        token_endpoint: None,
        retry_params: fast_retry_params(),
    })
}

fn test_config() -> TransferConfig {
    TransferConfig {
        num_threads: 2,
        connect_timeout: Duration::from_secs(5),
        read_timeout: Duration::from_secs(30),
        retry_params: fast_retry_params(),
        max_block_num_bytes: None,
        copy_buffer_num_bytes: 4 * 1024 * 1024,
    }
}

fn test_container(server: &MockServer, label: &str) -> AzureContainer {
    test_container_with_config(server, label, test_config())
}

/// Builds a handle on a fresh container named `label` plus a random
/// suffix, so no two scenarios ever address the same container.
fn test_container_with_config(
    server: &MockServer,
    label: &str,
    config: TransferConfig,
) -> AzureContainer {
    let container_name = append_random_suffix(label).to_lowercase();
    AzureContainer::new("acct", &container_name, static_session(), config)
        .unwrap()
        .with_endpoint(&server.uri())
}

fn deterministic_payload(num_bytes: usize) -> Vec<u8> {
    (0..num_bytes).map(|byte_idx| (byte_idx % 251) as u8).collect()
}

// ---- scenarios --------------------------------------------------------

#[tokio::test]
async fn test_small_blob_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();
    let service = FakeBlobService::new();
    let server = service.start().await;
    let container = test_container(&server, "ct-a");

    container.create().await.unwrap();
    assert!(container.exists().await.unwrap());

    container.put_text("k1", "one").await.unwrap();
    let content = container.get_all("k1").await.unwrap();
    assert_eq!(&content[..], b"one");
    assert_eq!(container.blob_num_bytes("k1").await.unwrap(), 3);
    assert_eq!(container.list_blobs(true).await.unwrap(), vec!["k1"]);
    let container_name = container.container_name().to_string();
    assert!(container
        .list_containers()
        .await
        .unwrap()
        .contains(&container_name));

    container.remove().await.unwrap();
    assert!(!container.exists().await.unwrap());
    assert!(!container
        .list_containers()
        .await
        .unwrap()
        .contains(&container_name));
}

#[tokio::test]
async fn test_create_container_is_idempotent() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let container = test_container(&server, "ct-a");
    container.create().await.unwrap();
    container.create().await.unwrap();
}

#[tokio::test]
async fn test_prefix_addressing_and_filterlist() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let container = test_container(&server, "ct-b").with_prefix("p");
    assert_eq!(
        container.dirname(),
        format!("{}/p", container.container_name())
    );

    container.create().await.unwrap();
    container.put_text("k1", "1").await.unwrap();
    container.put_text("k2", "2").await.unwrap();

    let stripped = container.list_blobs(true).await.unwrap();
    assert_eq!(stripped, vec!["k1", "k2"]);
    let full = container.list_blobs(false).await.unwrap();
    assert_eq!(full, vec!["p/k1", "p/k2"]);
}

#[tokio::test]
async fn test_blocked_upload_commits_in_plan_order() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let mut config = test_config();
    config.max_block_num_bytes = Some(1024 * 1024);
    let container = test_container_with_config(&server, "ct-a", config);
    container.create().await.unwrap();

    let payload = deterministic_payload(4 * 1024 * 1024 + 123);
    container
        .put("big", PutPayload::from(payload.clone()))
        .await
        .unwrap();

    {
        let state = service.state.lock().unwrap();
        assert_eq!(state.block_put_count, 5);
        assert_eq!(state.single_put_count, 0);
        let expected_ids: Vec<String> = (0..5)
            .map(|block_idx: usize| BASE64.encode(format!("{block_idx}")))
            .collect();
        let committed_key = format!("{}/big", container.container_name());
        assert_eq!(state.committed.get(&committed_key).unwrap(), &expected_ids);
    }

    let roundtrip = container.get_all("big").await.unwrap();
    assert_eq!(&roundtrip[..], &payload[..]);
}

#[tokio::test]
async fn test_large_blocked_upload_round_trip() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let container = test_container(&server, "ct-a");
    container.create().await.unwrap();

    // Two 32 MiB-ish blocks up, two sliced range reads down.
    let payload = deterministic_payload(64 * 1024 * 1024 + 3);
    container
        .put("large", PutPayload::from(payload.clone()))
        .await
        .unwrap();
    {
        let state = service.state.lock().unwrap();
        assert_eq!(state.block_put_count, 2);
    }
    let roundtrip = container.get_all("large").await.unwrap();
    assert_eq!(&roundtrip[..], &payload[..]);
}

#[tokio::test]
async fn test_single_threaded_mode_uses_single_request_path() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let mut config = test_config();
    config.num_threads = 1;
    config.max_block_num_bytes = Some(1024 * 1024);
    let container = test_container_with_config(&server, "ct-a", config);
    container.create().await.unwrap();

    let payload = deterministic_payload(3 * 1024 * 1024);
    container
        .put("solo", PutPayload::from(payload.clone()))
        .await
        .unwrap();
    {
        let state = service.state.lock().unwrap();
        assert_eq!(state.block_put_count, 0);
        assert_eq!(state.single_put_count, 1);
    }
    let roundtrip = container.get_all("solo").await.unwrap();
    assert_eq!(&roundtrip[..], &payload[..]);
}

#[tokio::test]
async fn test_duplicate_commit_race_is_idempotent() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let mut config = test_config();
    config.max_block_num_bytes = Some(128 * 1024);
    let container = test_container_with_config(&server, "ct-a", config);
    container.create().await.unwrap();

    service
        .state
        .lock()
        .unwrap()
        .race_once
        .insert(format!("{}/raced", container.container_name()));

    let payload = deterministic_payload(500 * 1024);
    container
        .put("raced", PutPayload::from(payload.clone()))
        .await
        .unwrap();
    let roundtrip = container.get_all("raced").await.unwrap();
    assert_eq!(&roundtrip[..], &payload[..]);
}

#[tokio::test]
async fn test_commit_race_with_mismatched_blocks_propagates() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let mut config = test_config();
    config.max_block_num_bytes = Some(128 * 1024);
    let container = test_container_with_config(&server, "ct-a", config);
    container.create().await.unwrap();

    service
        .state
        .lock()
        .unwrap()
        .race_mismatch
        .insert(format!("{}/mismatch", container.container_name()));

    let payload = deterministic_payload(500 * 1024);
    let error = container
        .put("mismatch", PutPayload::from(payload))
        .await
        .unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Service);
}

#[tokio::test]
async fn test_expired_token_triggers_exactly_one_refresh() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let token_server = MockServer::start().await;
    let expires_on = unix_now() + 3_600;
    Mock::given(method("POST"))
        .and(path("/contoso/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh-token",
            "expires_on": expires_on.to_string(),
        })))
        .expect(1)
        .mount(&token_server)
        .await;

    let session = AuthSession::new(SessionConfig {
        tenant: "contoso".to_string(),
        client_id: "client-1".to_string(),
        credential: Credential::ClientCredentials {
            client_secret: "s3cret".to_string(),
        },
        scope: None,
        resource: "https://storage.azure.com".to_string(),
        bearer: "initial-token".to_string(),
        expiry_unix_secs: unix_now() + 7_200,
        token_endpoint: Some(token_server.uri()),
        retry_params: fast_retry_params(),
    });
    let mut config = test_config();
    config.num_threads = 4;
    config.max_block_num_bytes = Some(128 * 1024);
    let container_name = append_random_suffix("ct-a").to_lowercase();
    let container = AzureContainer::new("acct", &container_name, session.clone(), config)
        .unwrap()
        .with_endpoint(&server.uri());
    container.create().await.unwrap();

    // Expire the token right before the blocks are dispatched: every
    // worker observes the stale expiry, exactly one refresh fires.
    session.install_token("initial-token".to_string(), unix_now());

    let payload = deterministic_payload(1024 * 1024);
    container
        .put("refreshed", PutPayload::from(payload.clone()))
        .await
        .unwrap();

    let roundtrip = container.get_all("refreshed").await.unwrap();
    assert_eq!(&roundtrip[..], &payload[..]);
    assert!(session.expiry_unix_secs() > unix_now() + 600);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let server = MockServer::start().await;
    struct FailTwice(AtomicUsize);
    impl Respond for FailTwice {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec())
            }
        }
    }
    Mock::given(any())
        .respond_with(FailTwice(AtomicUsize::new(0)))
        .expect(3)
        .mount(&server)
        .await;

    let container = test_container(&server, "ct-a");
    assert_eq!(container.blob_num_bytes("k1").await.unwrap(), 3);
}

#[tokio::test]
async fn test_throttling_honors_retry_after() {
    let server = MockServer::start().await;
    struct ThrottleOnce(AtomicUsize);
    impl Respond for ThrottleOnce {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).insert_header("retry-after", "0")
            } else {
                ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec())
            }
        }
    }
    Mock::given(any())
        .respond_with(ThrottleOnce(AtomicUsize::new(0)))
        .expect(2)
        .mount(&server)
        .await;

    let counters_before = get_perf_counters();
    let container = test_container(&server, "ct-a");
    assert_eq!(container.blob_num_bytes("k1").await.unwrap(), 2);
    let counters_after = get_perf_counters();
    assert!(counters_after.count_throttled > counters_before.count_throttled);
}

#[tokio::test]
async fn test_exhausted_retries_surface_the_last_error() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = test_config();
    config.retry_params.max_attempts = 3;
    let container = test_container_with_config(&server, "ct-a", config);
    let error = container.blob_num_bytes("k1").await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Service);
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let container = test_container(&server, "ct-a");
    let error = container.blob_num_bytes("k1").await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::Unauthorized);
}

#[tokio::test]
async fn test_delete_and_stat_semantics_on_missing_blob() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let container = test_container(&server, "ct-a");
    container.create().await.unwrap();

    // Idempotent delete.
    container.delete_blob("missing").await.unwrap();
    assert!(!container.blob_exists("missing").await.unwrap());
    let error = container.blob_num_bytes("missing").await.unwrap_err();
    assert_eq!(error.kind(), StorageErrorKind::DoesNotExist);

    container.put_text("present", "x").await.unwrap();
    assert!(container.blob_exists("present").await.unwrap());
    container.delete_blob("present").await.unwrap();
    assert!(!container.blob_exists("present").await.unwrap());
}

#[tokio::test]
async fn test_listing_follows_continuation_markers() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    service.state.lock().unwrap().list_page_size = Some(2);
    let container = test_container(&server, "ct-a");
    container.create().await.unwrap();

    for blob_idx in 0..5 {
        container
            .put_text(&format!("k{blob_idx}"), "x")
            .await
            .unwrap();
    }
    let names = container.list_blobs(true).await.unwrap();
    assert_eq!(names, vec!["k0", "k1", "k2", "k3", "k4"]);
}

#[tokio::test]
async fn test_server_side_copy() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let src_container = test_container(&server, "ct-src");
    let dst_container = test_container(&server, "ct-dst");
    src_container.create().await.unwrap();
    dst_container.create().await.unwrap();

    src_container.put_text("k1", "payload").await.unwrap();
    src_container
        .copy_blob("k1", &dst_container, "k1-copy")
        .await
        .unwrap();
    let copied = dst_container.get_all("k1-copy").await.unwrap();
    assert_eq!(&copied[..], b"payload");
}

#[tokio::test]
async fn test_touch_writes_a_single_nul_byte() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let container = test_container(&server, "ct-a");
    container.create().await.unwrap();

    container.touch("marker").await.unwrap();
    assert!(container.blob_exists("marker").await.unwrap());
    let content = container.get_all("marker").await.unwrap();
    assert_eq!(&content[..], &[0u8]);
}

#[tokio::test]
async fn test_remove_with_prefix_only_deletes_the_prefix() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let unscoped = test_container(&server, "ct-a");
    let scoped = unscoped.clone().with_prefix("p");
    unscoped.create().await.unwrap();

    scoped.put_text("k1", "1").await.unwrap();
    unscoped.put_text("q/k2", "2").await.unwrap();

    scoped.remove().await.unwrap();
    // The sibling blob keeps the container alive.
    assert!(unscoped.exists().await.unwrap());
    assert_eq!(unscoped.list_blobs(true).await.unwrap(), vec!["q/k2"]);

    unscoped.delete_blob("q/k2").await.unwrap();
    let scoped_again = unscoped.clone().with_prefix("p");
    scoped_again.put_text("k3", "3").await.unwrap();
    scoped_again.remove().await.unwrap();
    assert!(!unscoped.exists().await.unwrap());
}

#[tokio::test]
async fn test_file_copy_pipeline_round_trip() {
    let service = FakeBlobService::new();
    let server = service.start().await;
    let mut config = test_config();
    config.max_block_num_bytes = Some(1024 * 1024);
    config.copy_buffer_num_bytes = 4 * 1024 * 1024;
    let container = test_container_with_config(&server, "ct-a", config);
    container.create().await.unwrap();

    let payload = deterministic_payload(3 * 1024 * 1024 + 512 * 1024);
    let tempdir = tempfile::tempdir().unwrap();
    let upload_path = tempdir.path().join("source.bin");
    std::fs::write(&upload_path, &payload).unwrap();

    container
        .upload_file(&upload_path, "from-file")
        .await
        .unwrap();
    let uploaded = container.get_all("from-file").await.unwrap();
    assert_eq!(&uploaded[..], &payload[..]);

    let download_path = tempdir.path().join("downloaded.bin");
    container
        .download_file("from-file", &download_path)
        .await
        .unwrap();
    let downloaded = std::fs::read(&download_path).unwrap();
    assert_eq!(&downloaded[..], &payload[..]);
}
