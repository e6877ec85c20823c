use std::fmt;

use crate::RequestError;

/// Context handed to observers on retry and on give-up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDebugInfo {
    pub method: String,
    /// URL as passed by the caller, before base URL resolution.
    pub url: String,
    /// Caller-supplied headers.
    pub headers: Vec<(String, String)>,
    pub status: Option<u16>,
    pub status_text: Option<String>,
}

/// Hooks invoked synchronously by the retry loop.
///
/// Both methods default to no-ops.
pub trait RequestObserver: Send + Sync + fmt::Debug {
    /// Called before the sleep that precedes a retry.
    fn on_retry(&self, _error: &RequestError, _info: &RequestDebugInfo) {}

    /// Called once when the request is given up.
    fn on_error(&self, _error: &RequestError, _info: &RequestDebugInfo) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl RequestObserver for NoopObserver {}
