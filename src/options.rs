use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

use crate::{auth::NoAuth, AuthAgent, RequestError, Result};

/// Configures URL resolution, authentication and retry behavior of a
/// [`RequestClient`](crate::RequestClient).
#[derive(Clone)]
pub struct RequestConfig {
    /// Prefix joined with relative request URLs. Empty means "no base".
    pub base_url: String,
    /// Authorization agent shared by every call through the client.
    pub auth: Arc<dyn AuthAgent>,
    /// Number of retries after the initial attempt.
    pub retry_attempts: usize,
    /// Base delay before a retry.
    pub retry_delay: Duration,
    /// Additional delay added per attempt index.
    pub retry_delay_increment: Duration,
    /// Statuses that are retried with the computed delay.
    pub retry_status_codes: Vec<u16>,
    /// Statuses that invalidate the auth agent and retry immediately.
    pub auth_invalidate_status_codes: Vec<u16>,
    /// Default headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth: Arc::new(NoAuth),
            retry_attempts: 4,
            retry_delay: Duration::from_millis(500),
            retry_delay_increment: Duration::from_millis(500),
            retry_status_codes: vec![429, 502, 503, 504],
            auth_invalidate_status_codes: vec![401, 403],
            headers: Vec::new(),
        }
    }
}

impl fmt::Debug for RequestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConfig")
            .field("base_url", &self.base_url)
            .field("auth", &self.auth)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_delay", &self.retry_delay)
            .field("retry_delay_increment", &self.retry_delay_increment)
            .field("retry_status_codes", &self.retry_status_codes)
            .field(
                "auth_invalidate_status_codes",
                &self.auth_invalidate_status_codes,
            )
            .field("headers", &self.headers)
            .finish()
    }
}

impl RequestConfig {
    /// Reads overrides of the defaults from environment variables.
    ///
    /// Reads (all optional):
    /// - `REQUEST_BASE_URL`
    /// - `REQUEST_RETRY_ATTEMPTS`
    /// - `REQUEST_RETRY_DELAY_MS`
    /// - `REQUEST_RETRY_DELAY_INCREMENT_MS`
    ///
    /// Returns [`RequestError::Config`] when a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(base_url) = lookup("REQUEST_BASE_URL") {
            config.base_url = base_url.trim().to_owned();
        }
        if let Some(value) = lookup("REQUEST_RETRY_ATTEMPTS") {
            config.retry_attempts = parse_number("REQUEST_RETRY_ATTEMPTS", &value)? as usize;
        }
        if let Some(value) = lookup("REQUEST_RETRY_DELAY_MS") {
            config.retry_delay =
                Duration::from_millis(parse_number("REQUEST_RETRY_DELAY_MS", &value)?);
        }
        if let Some(value) = lookup("REQUEST_RETRY_DELAY_INCREMENT_MS") {
            config.retry_delay_increment = Duration::from_millis(parse_number(
                "REQUEST_RETRY_DELAY_INCREMENT_MS",
                &value,
            )?);
        }
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_auth(mut self, auth: impl AuthAgent + 'static) -> Self {
        self.auth = Arc::new(auth);
        self
    }

    /// Uses an agent that is also held elsewhere, e.g. to inspect OAuth2 state.
    pub fn with_shared_auth(mut self, auth: Arc<dyn AuthAgent>) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: usize) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration, increment: Duration) -> Self {
        self.retry_delay = delay;
        self.retry_delay_increment = increment;
        self
    }

    pub fn with_retry_status_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.retry_status_codes = codes.into();
        self
    }

    pub fn with_auth_invalidate_status_codes(mut self, codes: impl Into<Vec<u16>>) -> Self {
        self.auth_invalidate_status_codes = codes.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Total attempts made by one `send` call, never less than one.
    pub fn total_attempts(&self) -> usize {
        self.retry_attempts.saturating_add(1).max(1)
    }

    /// Delay before the retry that follows attempt `attempt_index` (zero-based).
    pub fn delay_for(&self, attempt_index: usize) -> Duration {
        let index = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        self.retry_delay
            .saturating_add(self.retry_delay_increment.saturating_mul(index))
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|err| RequestError::Config(format!("{name}='{value}' is not a number: {err}")))
}

/// Request payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    /// JSON document, sent as `application/json`.
    Json(serde_json::Value),
    /// URL-encoded form fields, sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// Plain text, sent as `text/plain`.
    Text(String),
    /// Opaque bytes; no content type is inferred.
    Bytes(Bytes),
}

impl Body {
    /// Builds a form body from name/value pairs.
    pub fn form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Form(
            pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }

    /// Content type implied by the body variant.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Self::Json(_) => Some("application/json"),
            Self::Form(_) => Some("application/x-www-form-urlencoded"),
            Self::Text(_) => Some("text/plain"),
            Self::Bytes(_) => None,
        }
    }

    /// Serializes the body for the wire.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Json(value) => Bytes::from(value.to_string()),
            Self::Form(pairs) => Bytes::from(encode_form(pairs)),
            Self::Text(text) => Bytes::from(text.clone()),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for Body {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Body {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for Body {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

pub(crate) fn encode_form(pairs: &[(String, String)]) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// Per-call options: body, query string, headers and cancellation.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub body: Option<Body>,
    pub query: Vec<(String, String)>,
    /// Caller headers; these win over defaults and the computed authorization.
    pub headers: Vec<(String, String)>,
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.body(Body::Json(value))
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Aborts the call before the next attempt or during a retry sleep.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}
