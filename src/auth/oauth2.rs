use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use super::{AuthAgent, AuthContext};
use crate::{
    Body, RequestClient, RequestConfig, RequestError, RequestOptions, Result, Transport,
};

/// Safety margin applied to a cached token's expiry, in seconds.
pub const DEFAULT_MIN_VALIDITY_SECONDS: u64 = 5 * 60;

fn default_min_validity_seconds() -> u64 {
    DEFAULT_MIN_VALIDITY_SECONDS
}

/// Credentials and cached token state of an [`OAuth2Agent`].
///
/// `access_token` and `expires_at` always change together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuth2Params {
    pub client_id: String,
    pub token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Expiry as Unix epoch milliseconds. `None` with a token means "never expires".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default = "default_min_validity_seconds")]
    pub min_validity_seconds: u64,
}

impl OAuth2Params {
    pub fn new(client_id: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            token_url: token_url.into(),
            client_secret: None,
            refresh_token: None,
            access_token: None,
            expires_at: None,
            min_validity_seconds: DEFAULT_MIN_VALIDITY_SECONDS,
        }
    }

    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Seeds a previously obtained access token with its epoch-millisecond expiry.
    pub fn with_access_token(mut self, token: impl Into<String>, expires_at: Option<u64>) -> Self {
        self.access_token = Some(token.into());
        self.expires_at = expires_at;
        self
    }

    pub fn with_min_validity_seconds(mut self, seconds: u64) -> Self {
        self.min_validity_seconds = seconds;
        self
    }

    fn valid_access_token(&self, now_ms: u64) -> Option<&str> {
        let token = self.access_token.as_deref().filter(|t| !t.is_empty())?;
        match self.expires_at {
            None => Some(token),
            Some(expires_at) => {
                let margin = self.min_validity_seconds.saturating_mul(1000);
                (expires_at.saturating_sub(margin) > now_ms).then_some(token)
            }
        }
    }
}

impl fmt::Debug for OAuth2Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("OAuth2Params")
            .field("client_id", &self.client_id)
            .field("token_url", &self.token_url)
            .field("client_secret", &redact(&self.client_secret))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("access_token", &redact(&self.access_token))
            .field("expires_at", &self.expires_at)
            .field("min_validity_seconds", &self.min_validity_seconds)
            .finish()
    }
}

/// Tokens returned by the token endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct OAuth2Tokens {
    pub access_token: String,
    /// Lifetime in seconds.
    pub access_expires_in: Option<f64>,
    pub refresh_token: Option<String>,
}

impl OAuth2Tokens {
    /// Decodes a token endpoint JSON body.
    pub fn from_json(body: &[u8]) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|err| RequestError::MalformedTokenResponse(format!("invalid JSON: {err}")))?;

        let access_token = match value.get("access_token") {
            Some(serde_json::Value::String(token)) if token.is_empty() => {
                return Err(RequestError::MalformedTokenResponse(
                    "access_token is empty".to_owned(),
                ))
            }
            Some(serde_json::Value::String(token)) => token.clone(),
            Some(_) => {
                return Err(RequestError::MalformedTokenResponse(
                    "access_token is not a string".to_owned(),
                ))
            }
            None => {
                return Err(RequestError::MalformedTokenResponse(
                    "access_token is missing".to_owned(),
                ))
            }
        };

        let access_expires_in = match value.get("expires_in") {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Number(seconds)) => seconds.as_f64(),
            Some(_) => {
                return Err(RequestError::MalformedTokenResponse(
                    "expires_in is not a number".to_owned(),
                ))
            }
        };

        let refresh_token = value
            .get("refresh_token")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        Ok(Self {
            access_token,
            access_expires_in,
            refresh_token,
        })
    }
}

/// OAuth2 agent producing `Bearer <access_token>` headers.
///
/// Tokens are resolved in three stages: the cached access token, a
/// `refresh_token` grant, then a `client_credentials` grant. A failing stage
/// invalidates the cached token and falls through to the next one; when every
/// stage misses, no header is attached.
///
/// Refreshes are serialized per agent: concurrent callers that find the cache
/// stale wait for the in-flight exchange and reuse its result.
pub struct OAuth2Agent {
    state: Mutex<OAuth2Params>,
    refresh_gate: tokio::sync::Mutex<()>,
    token_client: RequestClient,
}

impl fmt::Debug for OAuth2Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Agent")
            .field("params", &*self.lock_state())
            .finish()
    }
}

impl OAuth2Agent {
    /// Creates an agent talking to the token endpoint through `reqwest`.
    pub fn new(params: OAuth2Params) -> Self {
        Self {
            state: Mutex::new(params),
            refresh_gate: tokio::sync::Mutex::new(()),
            token_client: RequestClient::new(RequestConfig::default()),
        }
    }

    /// Routes token endpoint calls through `transport`.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.token_client = self.token_client.with_shared_transport(transport);
        self
    }

    /// Retry policy of token endpoint calls (defaults to [`RequestConfig::default`]).
    pub fn with_token_request_config(mut self, config: RequestConfig) -> Self {
        self.token_client = self.token_client.with_config(config);
        self
    }

    /// Snapshot of the current credentials and token state.
    pub fn params(&self) -> OAuth2Params {
        self.lock_state().clone()
    }

    /// Stores tokens obtained outside of this agent.
    pub fn set_tokens(&self, tokens: OAuth2Tokens) {
        let expires_at = tokens.access_expires_in.map(|seconds| {
            let lifetime_ms = (seconds.max(0.0) * 1000.0) as u64;
            now_millis().saturating_add(lifetime_ms)
        });
        let mut state = self.lock_state();
        state.access_token = Some(tokens.access_token);
        state.expires_at = expires_at;
        if let Some(refresh_token) = tokens.refresh_token.filter(|t| !t.is_empty()) {
            state.refresh_token = Some(refresh_token);
        }
    }

    /// Resolves an access token through the cached, refresh and
    /// client-credentials stages.
    pub async fn access_token(&self) -> Option<String> {
        if let Some(token) = self.try_cached_access_token() {
            #[cfg(feature = "tracing")]
            tracing::debug!("using cached oauth2 access token");
            return Some(token);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while this one waited.
        if let Some(token) = self.try_cached_access_token() {
            #[cfg(feature = "tracing")]
            tracing::debug!("using oauth2 access token refreshed by a concurrent caller");
            return Some(token);
        }

        match self.try_refresh_token().await {
            Ok(Some(token)) => return Some(token),
            Ok(None) => {}
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_err, "oauth2 refresh_token grant failed");
                // A rejected refresh token is never retried.
                self.lock_state().refresh_token = None;
                self.invalidate();
            }
        }

        match self.try_client_secret().await {
            Ok(Some(token)) => return Some(token),
            Ok(None) => {}
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %_err, "oauth2 client_credentials grant failed");
                self.invalidate();
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("oauth2 agent has no usable credentials");
        None
    }

    fn try_cached_access_token(&self) -> Option<String> {
        let state = self.lock_state();
        state.valid_access_token(now_millis()).map(str::to_owned)
    }

    async fn try_refresh_token(&self) -> Result<Option<String>> {
        let (client_id, client_secret, refresh_token) = {
            let state = self.lock_state();
            let Some(refresh_token) = state.refresh_token.clone().filter(|t| !t.is_empty()) else {
                return Ok(None);
            };
            (state.client_id.clone(), state.client_secret.clone(), refresh_token)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("requesting oauth2 token with refresh_token grant");

        let tokens = self
            .create_token(&[
                ("grant_type", Some("refresh_token".to_owned())),
                ("client_id", Some(client_id)),
                ("client_secret", client_secret),
                ("refresh_token", Some(refresh_token)),
            ])
            .await?;
        let access_token = tokens.access_token.clone();
        self.set_tokens(tokens);
        Ok(Some(access_token))
    }

    async fn try_client_secret(&self) -> Result<Option<String>> {
        let (client_id, client_secret) = {
            let state = self.lock_state();
            let Some(client_secret) = state.client_secret.clone().filter(|s| !s.is_empty()) else {
                return Ok(None);
            };
            (state.client_id.clone(), client_secret)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("requesting oauth2 token with client_credentials grant");

        let tokens = self
            .create_token(&[
                ("grant_type", Some("client_credentials".to_owned())),
                ("client_id", Some(client_id)),
                ("client_secret", Some(client_secret)),
            ])
            .await?;
        let access_token = tokens.access_token.clone();
        self.set_tokens(tokens);
        Ok(Some(access_token))
    }

    async fn create_token(&self, fields: &[(&str, Option<String>)]) -> Result<OAuth2Tokens> {
        let token_url = self.lock_state().token_url.clone();
        let form = Body::form(
            fields
                .iter()
                .filter_map(|(name, value)| value.clone().map(|value| (*name, value))),
        );
        let response = self
            .token_client
            .send(Method::POST, &token_url, RequestOptions::new().body(form))
            .await?;
        OAuth2Tokens::from_json(&response.body)
    }

    fn lock_state(&self) -> MutexGuard<'_, OAuth2Params> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AuthAgent for OAuth2Agent {
    async fn header(&self, _ctx: &AuthContext<'_>) -> Result<Option<String>> {
        Ok(self
            .access_token()
            .await
            .map(|token| format!("Bearer {token}")))
    }

    /// Clears the access token and its expiry; refresh token and client
    /// secret stay usable.
    fn invalidate(&self) {
        let mut state = self.lock_state();
        state.access_token = None;
        state.expires_at = None;
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
