use std::{borrow::Cow, collections::BTreeMap, sync::Arc, time::Duration};

use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    auth::AuthContext, Body, NoopObserver, ReqwestTransport, RequestConfig, RequestDebugInfo,
    RequestError, RequestObserver, RequestOptions, RequestSpec, Response, Result, Transport,
};

/// Resolves `url` against `base_url` and appends `query`.
///
/// An absolute `url` ignores the base. Otherwise the base is treated as a
/// directory (a trailing slash is ensured) and a leading slash on `url` is
/// dropped, so `http://h/a/b` + `/c` gives `http://h/a/b/c`.
pub fn resolve_url(base_url: &str, url: &str, query: &[(String, String)]) -> Result<Url> {
    let invalid = |err: url::ParseError| RequestError::InvalidUrl {
        url: url.to_owned(),
        message: err.to_string(),
    };

    let mut resolved = match Url::parse(url) {
        Ok(absolute) => absolute,
        Err(url::ParseError::RelativeUrlWithoutBase) if !base_url.is_empty() => {
            let base: Cow<'_, str> = if base_url.ends_with('/') {
                Cow::Borrowed(base_url)
            } else {
                Cow::Owned(format!("{base_url}/"))
            };
            let relative = url.strip_prefix('/').unwrap_or(url);
            Url::parse(&base)
                .and_then(|base| base.join(relative))
                .map_err(invalid)?
        }
        Err(err) => return Err(invalid(err)),
    };

    if !query.is_empty() {
        resolved
            .query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(resolved)
}

/// Merges header layers from lowest to highest priority.
///
/// Names are lower-cased, later layers win and empty values are dropped.
pub fn merge_headers(layers: &[&[(String, String)]]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (name, value) in layers.iter().flat_map(|layer| layer.iter()) {
        if value.is_empty() {
            continue;
        }
        merged.insert(name.to_ascii_lowercase(), value.clone());
    }
    merged
}

#[derive(Clone, Debug)]
/// HTTP client wrapping every call in the retry and auth-invalidation loop.
pub struct RequestClient {
    config: RequestConfig,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn RequestObserver>,
}

impl Default for RequestClient {
    fn default() -> Self {
        Self::new(RequestConfig::default())
    }
}

impl RequestClient {
    /// Creates a client sending through [`ReqwestTransport`].
    pub fn new(config: RequestConfig) -> Self {
        Self {
            config,
            transport: Arc::new(ReqwestTransport::new()),
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_config(mut self, config: RequestConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_transport(self, transport: impl Transport + 'static) -> Self {
        self.with_shared_transport(Arc::new(transport))
    }

    pub fn with_shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Installs retry/error hooks.
    pub fn with_observer(mut self, observer: impl RequestObserver + 'static) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<T>> {
        self.send_json(Method::GET, url, options).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<T>> {
        self.send_json(Method::POST, url, options).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<T>> {
        self.send_json(Method::PUT, url, options).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<T>> {
        self.send_json(Method::DELETE, url, options).await
    }

    /// Sends a JSON request and decodes the JSON response.
    ///
    /// The body always goes out as JSON: text becomes a JSON string and form
    /// pairs become an object. Raw byte bodies are rejected with
    /// [`RequestError::Config`]; use [`send`](Self::send) for those.
    ///
    /// Returns `None` for `204 No Content` or a zero `content-length`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        mut options: RequestOptions,
    ) -> Result<Option<T>> {
        options.headers.insert(
            0,
            ("content-type".to_owned(), "application/json".to_owned()),
        );
        options.body = options.body.take().map(json_body).transpose()?;

        let response = self.send(method, url, options).await?;
        if response.is_empty_body() {
            return Ok(None);
        }
        response.json().map(Some)
    }

    /// Sends a request, retrying transient failures and configured statuses.
    ///
    /// Makes at most `retry_attempts + 1` attempts. A status listed in
    /// `auth_invalidate_status_codes` invalidates the auth agent and retries
    /// without delay; a status in `retry_status_codes` or a transient network
    /// failure retries after `retry_delay + retry_delay_increment * attempt`.
    /// Anything else fails immediately.
    ///
    /// Every retryable failure notifies `on_retry` and waits out its delay,
    /// the last attempt included; `on_error` fires once when giving up.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        let total_attempts = self.config.total_attempts();
        let mut last_error = None;
        for attempt in 0..total_attempts {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(RequestError::Cancelled);
            }

            let error = match self.attempt(&method, url, &options, attempt + 1).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let mut delay = self.config.delay_for(attempt);
            let mut retry = error.is_transient();
            if let Some(status) = error.status() {
                if self.config.auth_invalidate_status_codes.contains(&status) {
                    self.config.auth.invalidate();
                    retry = true;
                    delay = Duration::ZERO;
                } else if self.config.retry_status_codes.contains(&status) {
                    retry = true;
                }
            }

            let info = debug_info(&method, url, &options, &error);
            if !retry {
                #[cfg(feature = "tracing")]
                tracing::warn!(method = %method, url, error = %error, "request failed");
                self.observer.on_error(&error, &info);
                return Err(error);
            }

            self.observer.on_retry(&error, &info);
            #[cfg(feature = "tracing")]
            tracing::debug!(
                method = %method,
                url,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            self.wait_before_retry(delay, options.cancel.as_ref()).await?;
            last_error = Some((error, info));
        }

        match last_error {
            Some((error, info)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    method = %method,
                    url,
                    attempts = total_attempts,
                    error = %error,
                    "giving up on request"
                );
                self.observer.on_error(&error, &info);
                Err(error)
            }
            None => Err(RequestError::Config(
                "request made no attempts".to_owned(),
            )),
        }
    }

    /// Performs exactly one attempt and returns whatever the transport answered,
    /// including non-2xx responses.
    pub async fn send_raw(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response> {
        let spec = self.prepare_request_spec(&method, url, &options).await?;
        self.fetch(&spec, 1).await
    }

    /// Builds the request for one attempt: resolved URL, authorization and
    /// merged headers.
    ///
    /// Header priority, low to high: inferred content type, configured
    /// defaults, agent authorization, caller headers.
    pub async fn prepare_request_spec(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<RequestSpec> {
        let full_url = resolve_url(&self.config.base_url, url, &options.query)?.to_string();
        let body = options.body.as_ref();

        let authorization = self
            .config
            .auth
            .header(&AuthContext {
                method,
                url: &full_url,
                body,
            })
            .await?
            .unwrap_or_default();
        let content_type = body
            .and_then(Body::content_type)
            .unwrap_or_default()
            .to_owned();

        let inferred = [("content-type".to_owned(), content_type)];
        let auth = [("authorization".to_owned(), authorization)];
        let headers = merge_headers(&[
            inferred.as_slice(),
            self.config.headers.as_slice(),
            auth.as_slice(),
            options.headers.as_slice(),
        ]);

        Ok(RequestSpec {
            method: method.clone(),
            url: full_url,
            headers,
            body: options.body.clone(),
        })
    }

    async fn attempt(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
        attempt: usize,
    ) -> Result<Response> {
        let spec = self.prepare_request_spec(method, url, options).await?;
        let response = self.fetch(&spec, attempt).await?;
        if !response.ok() {
            return Err(RequestError::Http {
                method: spec.method.to_string(),
                url: spec.url,
                status: response.status,
                status_text: response.status_text,
                attempt,
            });
        }
        Ok(response)
    }

    async fn fetch(&self, spec: &RequestSpec, attempt: usize) -> Result<Response> {
        self.transport
            .fetch(spec)
            .await
            .map_err(|source| RequestError::Network {
                method: spec.method.to_string(),
                url: spec.url.clone(),
                attempt,
                source,
            })
    }

    async fn wait_before_retry(
        &self,
        delay: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(RequestError::Cancelled),
                _ = sleep(delay) => Ok(()),
            },
            None => {
                sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn json_body(body: Body) -> Result<Body> {
    match body {
        Body::Json(value) => Ok(Body::Json(value)),
        Body::Text(text) => Ok(Body::Json(serde_json::Value::String(text))),
        Body::Form(pairs) => Ok(Body::Json(serde_json::Value::Object(
            pairs
                .into_iter()
                .map(|(name, value)| (name, serde_json::Value::String(value)))
                .collect(),
        ))),
        Body::Bytes(_) => Err(RequestError::Config(
            "byte bodies cannot be JSON-encoded; use send instead".to_owned(),
        )),
    }
}

fn debug_info(
    method: &Method,
    url: &str,
    options: &RequestOptions,
    error: &RequestError,
) -> RequestDebugInfo {
    RequestDebugInfo {
        method: method.to_string(),
        url: url.to_owned(),
        headers: options.headers.clone(),
        status: error.status(),
        status_text: error.status_text().map(str::to_owned),
    }
}
