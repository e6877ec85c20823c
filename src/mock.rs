//! Scripted [`Transport`] double that records every call.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderName, HeaderValue};

use crate::{NetworkErrorKind, RequestSpec, Response, Transport, TransportError};

/// What the mock answers for one call.
#[derive(Clone, Debug)]
pub enum MockReply {
    Response {
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    NetworkError(Option<NetworkErrorKind>),
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self::Response {
            status,
            headers: Vec::new(),
            body: Bytes::from_static(b"{}"),
        }
    }

    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self::Response {
            status,
            headers: vec![("content-type".to_owned(), "application/json".to_owned())],
            body: Bytes::from(body.to_string()),
        }
    }

    /// Transport failure; `None` means an unrecognized, non-transient failure.
    pub fn network_error(kind: Option<NetworkErrorKind>) -> Self {
        Self::NetworkError(kind)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let Self::Response { headers, .. } = &mut self {
            headers.push((name.into(), value.into()));
        }
        self
    }

    pub fn with_body(mut self, new_body: impl Into<Bytes>) -> Self {
        if let Self::Response { body, .. } = &mut self {
            *body = new_body.into();
        }
        self
    }

    fn into_result(self) -> std::result::Result<Response, TransportError> {
        match self {
            Self::Response {
                status,
                headers,
                body,
            } => {
                let mut response = Response::new(status, body);
                for (name, value) in headers {
                    let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(name.as_bytes()),
                        HeaderValue::from_str(&value),
                    ) else {
                        continue;
                    };
                    response.headers.append(name, value);
                }
                Ok(response)
            }
            Self::NetworkError(Some(kind)) => Err(TransportError::network(kind)),
            Self::NetworkError(None) => Err(TransportError::new("mock transport failure")),
        }
    }
}

/// One recorded transport invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

#[derive(Debug)]
struct MockState {
    script: VecDeque<MockReply>,
    fallback: MockReply,
    calls: Vec<RecordedCall>,
}

/// Answers scripted replies in order, then repeats the fallback reply.
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Answers `reply` to every call.
    pub fn always(reply: MockReply) -> Self {
        Self::sequence(Vec::new(), reply)
    }

    /// Answers `script` in order, then `fallback` forever.
    pub fn sequence(script: Vec<MockReply>, fallback: MockReply) -> Self {
        Self {
            state: Mutex::new(MockState {
                script: script.into(),
                fallback,
                calls: Vec::new(),
            }),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.lock().calls.last().cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, spec: &RequestSpec) -> std::result::Result<Response, TransportError> {
        let reply = {
            let mut state = self.lock();
            state.calls.push(RecordedCall {
                method: spec.method.to_string(),
                url: spec.url.clone(),
                headers: spec.headers.clone(),
                body: spec.body.as_ref().map(|body| body.to_bytes()),
            });
            match state.script.pop_front() {
                Some(reply) => reply,
                None => state.fallback.clone(),
            }
        };
        reply.into_result()
    }
}
