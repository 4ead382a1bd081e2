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
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use azstore_common::retry::{retry, RetryParams, Retryable};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

pub static DEFAULT_TOKEN_ENDPOINT: &str = "https://login.microsoft.com";

/// A refresh fires once `now` enters this window before the token expiry.
const REFRESH_GRACE: Duration = Duration::from_secs(600);

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is set before the Unix epoch")
        .as_secs()
}

/// The refreshable credential variants of a session.
///
/// Auth-code and device-code flows both end up holding a refresh token;
/// managed-identity tokens are installed from outside and cannot be
/// refreshed by this crate.
#[derive(Clone)]
pub enum Credential {
    ClientCredentials { client_secret: String },
    RefreshToken { refresh_token: String },
    Static,
}

impl fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Secret material stays out of logs.
        match self {
            Credential::ClientCredentials { .. } => formatter.write_str("ClientCredentials"),
            Credential::RefreshToken { .. } => formatter.write_str("RefreshToken"),
            Credential::Static => formatter.write_str("Static"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no refreshable credential available")]
    MissingRefreshableCredential,
    #[error("failed to reach the token endpoint: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint rejected the refresh request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed token response: {0}")]
    InvalidResponse(String),
}

/// Everything needed to construct an [`AuthSession`].
pub struct SessionConfig {
    pub tenant: String,
    pub client_id: String,
    pub credential: Credential,
    pub scope: Option<String>,
    pub resource: String,
    /// Initially acquired bearer token.
    pub bearer: String,
    /// Expiry of `bearer` in Unix seconds.
    pub expiry_unix_secs: u64,
    /// Token endpoint base; tests point this at an emulator.
    pub token_endpoint: Option<String>,
    pub retry_params: RetryParams,
}

struct TokenState {
    bearer: String,
    expiry_unix_secs: u64,
}

struct SessionInner {
    tenant: String,
    client_id: String,
    scope: Option<String>,
    resource: String,
    token_endpoint: String,
    retry_params: RetryParams,
    client: reqwest::Client,
    token: ArcSwap<TokenState>,
    credential: Mutex<Credential>,
    // Serializes refreshes. Never held across a token read: readers go
    // straight through the ArcSwap.
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Shared, refreshable OAuth2 credential holder.
///
/// Cloning is cheap and every clone addresses the same token state.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("tenant", &self.inner.tenant)
            .field("client_id", &self.inner.client_id)
            .field("expiry_unix_secs", &self.expiry_unix_secs())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(deserialize_with = "deserialize_expires_on")]
    expires_on: u64,
}

/// The login endpoint returns `expires_on` either as a JSON number or as a
/// decimal string, depending on the grant.
fn deserialize_expires_on<'de, D>(deserializer: D) -> Result<u64, D::Error>
where D: Deserializer<'de> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(expires_on) => Ok(expires_on),
        NumberOrString::String(expires_on) => expires_on.parse().map_err(D::Error::custom),
    }
}

#[derive(Debug, Error)]
enum RefreshAttemptError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },
}

impl Retryable for RefreshAttemptError {
    fn is_retryable(&self) -> bool {
        match self {
            RefreshAttemptError::Http(error) => !error.is_builder(),
            RefreshAttemptError::Status { status, .. } => matches!(status, 429 | 500 | 503),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RefreshAttemptError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl AuthSession {
    pub fn new(config: SessionConfig) -> Self {
        let token_endpoint = config
            .token_endpoint
            .unwrap_or_else(|| DEFAULT_TOKEN_ENDPOINT.to_string());
        let inner = SessionInner {
            tenant: config.tenant,
            client_id: config.client_id,
            scope: config.scope,
            resource: config.resource,
            token_endpoint,
            retry_params: config.retry_params,
            client: reqwest::Client::new(),
            token: ArcSwap::from_pointee(TokenState {
                bearer: config.bearer,
                expiry_unix_secs: config.expiry_unix_secs,
            }),
            credential: Mutex::new(config.credential),
            refresh_lock: tokio::sync::Mutex::new(()),
        };
        AuthSession {
            inner: Arc::new(inner),
        }
    }

    /// Returns a bearer token valid for at least the grace window,
    /// refreshing it first if necessary.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        let now = unix_now();
        let token = self.inner.token.load();
        if now < token.expiry_unix_secs.saturating_sub(REFRESH_GRACE.as_secs()) {
            return Ok(token.bearer.clone());
        }
        self.refresh(now).await
    }

    pub fn expiry_unix_secs(&self) -> u64 {
        self.inner.token.load().expiry_unix_secs
    }

    /// Installs an externally acquired token, e.g. from a managed-identity
    /// sidecar. Unlike a refresh, this write-back may shorten the expiry.
    pub fn install_token(&self, bearer: String, expiry_unix_secs: u64) {
        self.inner.token.store(Arc::new(TokenState {
            bearer,
            expiry_unix_secs,
        }));
    }

    /// Overwrites secret material in place. The session is unusable for
    /// refreshes afterwards.
    pub fn scrub(&self) {
        let mut credential = self
            .inner
            .credential
            .lock()
            .expect("Credential lock is poisoned");
        match &mut *credential {
            Credential::ClientCredentials { client_secret } => {
                client_secret.replace_range(.., &"\0".repeat(client_secret.len()));
                client_secret.clear();
            }
            Credential::RefreshToken { refresh_token } => {
                refresh_token.replace_range(.., &"\0".repeat(refresh_token.len()));
                refresh_token.clear();
            }
            Credential::Static => {}
        }
        *credential = Credential::Static;
    }

    async fn refresh(&self, now: u64) -> Result<String, AuthError> {
        let _guard = self.inner.refresh_lock.lock().await;

        // Coalesce: a refresh that completed while this task waited on the
        // lock has already widened the expiry.
        let token = self.inner.token.load();
        if now < token.expiry_unix_secs.saturating_sub(REFRESH_GRACE.as_secs()) {
            return Ok(token.bearer.clone());
        }
        let previous_expiry = token.expiry_unix_secs;

        let credential = self
            .inner
            .credential
            .lock()
            .expect("Credential lock is poisoned")
            .clone();
        let form = self.refresh_form(&credential)?;

        let token_response = retry(&self.inner.retry_params, || self.post_token_request(&form))
            .await
            .map_err(|error| match error {
                RefreshAttemptError::Http(error) => AuthError::Transport(error),
                RefreshAttemptError::Status { status, body, .. } => {
                    AuthError::Rejected { status, body }
                }
            })?;

        // Refreshes only ever widen the expiry.
        let expiry_unix_secs = token_response.expires_on.max(previous_expiry);
        self.inner.token.store(Arc::new(TokenState {
            bearer: token_response.access_token.clone(),
            expiry_unix_secs,
        }));
        if let Some(rotated) = token_response.refresh_token {
            let mut credential = self
                .inner
                .credential
                .lock()
                .expect("Credential lock is poisoned");
            if let Credential::RefreshToken { refresh_token } = &mut *credential {
                *refresh_token = rotated;
            }
        }
        debug!(expiry_unix_secs = %expiry_unix_secs, "Refreshed bearer token");
        Ok(token_response.access_token)
    }

    fn refresh_form(&self, credential: &Credential) -> Result<Vec<(&'static str, String)>, AuthError> {
        let inner = &self.inner;
        let mut form = match credential {
            Credential::RefreshToken { refresh_token } => {
                let mut form = vec![
                    ("client_id", inner.client_id.clone()),
                    ("refresh_token", refresh_token.clone()),
                    ("grant_type", "refresh_token".to_string()),
                ];
                if let Some(scope) = &inner.scope {
                    form.push(("scope", scope.clone()));
                }
                form
            }
            Credential::ClientCredentials { client_secret } => vec![
                ("grant_type", "client_credentials".to_string()),
                ("client_id", inner.client_id.clone()),
                ("client_secret", client_secret.clone()),
            ],
            Credential::Static => return Err(AuthError::MissingRefreshableCredential),
        };
        form.push(("resource", inner.resource.clone()));
        Ok(form)
    }

    async fn post_token_request(
        &self,
        form: &[(&'static str, String)],
    ) -> Result<TokenResponse, RefreshAttemptError> {
        let url = format!(
            "{}/{}/oauth2/token",
            self.inner.token_endpoint, self.inner.tenant
        );
        let response = self.inner.client.post(&url).form(form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshAttemptError::Status {
                status: status.as_u16(),
                retry_after,
                body,
            });
        }
        Ok(response.json::<TokenResponse>().await?)
    }
}
