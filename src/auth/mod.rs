//! Authorization agents.
//!
//! An [`AuthAgent`] produces the `Authorization` header value for a request
//! and can be told to drop cached credentials after the server rejected them.

mod oauth1;
mod oauth2;

use std::fmt;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Method;

use crate::{Body, Result};

pub use oauth1::{OAuth1Agent, OAuth1Params, RsaSha1Signer, SignatureMethod};
pub use oauth2::{OAuth2Agent, OAuth2Params, OAuth2Tokens, DEFAULT_MIN_VALIDITY_SECONDS};

/// The request an authorization header is computed for.
#[derive(Clone, Copy, Debug)]
pub struct AuthContext<'a> {
    pub method: &'a Method,
    /// Fully resolved URL including the query string.
    pub url: &'a str,
    pub body: Option<&'a Body>,
}

#[async_trait]
pub trait AuthAgent: Send + Sync + fmt::Debug {
    /// Returns the `Authorization` value, or `None` when nothing should be attached.
    async fn header(&self, ctx: &AuthContext<'_>) -> Result<Option<String>>;

    /// Drops cached credentials so the next [`AuthAgent::header`] re-derives them.
    fn invalidate(&self) {}
}

/// Never attaches an authorization header.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthAgent for NoAuth {
    async fn header(&self, _ctx: &AuthContext<'_>) -> Result<Option<String>> {
        Ok(None)
    }
}

/// `Basic base64(username:password)`.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn header_value(&self) -> String {
        let encoded = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {encoded}")
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl AuthAgent for BasicAuth {
    async fn header(&self, _ctx: &AuthContext<'_>) -> Result<Option<String>> {
        Ok(Some(self.header_value()))
    }
}

/// `<prefix> <token>` with `Bearer` as the default prefix.
#[derive(Clone)]
pub struct BearerAuth {
    prefix: String,
    token: Option<String>,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            prefix: "Bearer".to_owned(),
            token: Some(token.into()),
        }
    }

    /// An agent without a token; it attaches nothing.
    pub fn empty() -> Self {
        Self {
            prefix: "Bearer".to_owned(),
            token: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn header_value(&self) -> Option<String> {
        self.token
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(|token| format!("{} {token}", self.prefix))
    }
}

impl fmt::Debug for BearerAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerAuth")
            .field("prefix", &self.prefix)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[async_trait]
impl AuthAgent for BearerAuth {
    async fn header(&self, _ctx: &AuthContext<'_>) -> Result<Option<String>> {
        Ok(self.header_value())
    }
}
