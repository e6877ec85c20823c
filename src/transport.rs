use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::{Body, RequestError, Result, TransportError};

/// One fully prepared attempt: resolved URL, merged headers and body.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub url: String,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Body>,
}

/// Buffered HTTP response as returned by a [`Transport`].
#[derive(Clone, Debug)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    /// Builds a response with the canonical reason phrase for `status`.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        let status_text = StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or_default()
            .to_owned();
        Self {
            status,
            status_text,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// 204 or an explicit `content-length: 0`.
    pub fn is_empty_body(&self) -> bool {
        self.status == 204 || self.header("content-length").map(str::trim) == Some("0")
    }

    pub fn text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|err| RequestError::Decode(format!("response body is not UTF-8: {err}")))
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|err| {
            RequestError::Decode(format!(
                "invalid JSON response: {err}; body: {}",
                String::from_utf8_lossy(&self.body)
            ))
        })
    }

    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }
}

/// Performs exactly one network call for a prepared [`RequestSpec`].
///
/// Implementations must not retry; the client owns the retry policy.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn fetch(&self, spec: &RequestSpec) -> std::result::Result<Response, TransportError>;
}

/// Default [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured `reqwest` client (proxies, TLS roots, ...).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: None,
        }
    }

    /// Per-attempt timeout enforced by `reqwest`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn fetch(&self, spec: &RequestSpec) -> std::result::Result<Response, TransportError> {
        let mut request = self.http.request(spec.method.clone(), &spec.url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.body(body.to_bytes());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::{HeaderValue, CONTENT_LENGTH};

    use super::Response;

    #[test]
    fn status_text_uses_canonical_reason() {
        let response = Response::new(503, "");
        assert_eq!(response.status_text, "Service Unavailable");
        assert!(!response.ok());
        assert!(Response::new(201, "").ok());
    }

    #[test]
    fn empty_body_detection() {
        assert!(Response::new(204, "").is_empty_body());

        let mut response = Response::new(200, "");
        response
            .headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert!(response.is_empty_body());
        assert!(!Response::new(200, "{}").is_empty_body());
    }

    #[test]
    fn json_decode_error_includes_body() {
        let response = Response::new(200, "not json");
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert!(err.to_string().contains("not json"));
    }
}
