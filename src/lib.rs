//! `request-agent` is an async HTTP request client with pluggable authentication.
//!
//! Every call made through [`RequestClient::send`] runs in a retry loop:
//! - statuses in `retry_status_codes` and transient network failures are
//!   retried after a linearly growing delay
//! - statuses in `auth_invalidate_status_codes` invalidate the
//!   [`AuthAgent`] and retry immediately
//! - anything else fails on the spot
//!
//! Authorization headers come from an [`AuthAgent`]: [`NoAuth`],
//! [`BasicAuth`], [`BearerAuth`], [`OAuth1Agent`] or [`OAuth2Agent`], the
//! latter caching and refreshing access tokens on its own.

pub mod auth;
mod client;
mod error;
pub mod mock;
mod observer;
mod options;
mod transport;

pub use auth::{
    AuthAgent, AuthContext, BasicAuth, BearerAuth, NoAuth, OAuth1Agent, OAuth1Params,
    OAuth2Agent, OAuth2Params, OAuth2Tokens, RsaSha1Signer, SignatureMethod,
};
pub use client::{merge_headers, resolve_url, RequestClient};
pub use error::{NetworkErrorKind, RequestError, TransportError};
pub use observer::{NoopObserver, RequestDebugInfo, RequestObserver};
pub use options::{Body, RequestConfig, RequestOptions};
pub use transport::{ReqwestTransport, RequestSpec, Response, Transport};

pub use reqwest::Method;
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, RequestError>;
