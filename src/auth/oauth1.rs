use std::{
    fmt,
    str::FromStr,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use url::Url;

use super::{AuthAgent, AuthContext};
use crate::{Body, RequestError, Result};

/// RFC 3986 unreserved characters stay as-is; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureMethod {
    HmacSha1,
    HmacSha256,
    RsaSha1,
    Plaintext,
}

impl SignatureMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha1 => "HMAC-SHA1",
            Self::HmacSha256 => "HMAC-SHA256",
            Self::RsaSha1 => "RSA-SHA1",
            Self::Plaintext => "PLAINTEXT",
        }
    }
}

impl FromStr for SignatureMethod {
    type Err = RequestError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "HMAC-SHA1" => Ok(Self::HmacSha1),
            "HMAC-SHA256" => Ok(Self::HmacSha256),
            "RSA-SHA1" => Ok(Self::RsaSha1),
            "PLAINTEXT" => Ok(Self::Plaintext),
            other => Err(RequestError::SignatureMethod(format!(
                "Invalid signature method {other}"
            ))),
        }
    }
}

impl fmt::Display for SignatureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces RSA-SHA1 signatures (PKCS#1 v1.5) over a signature base string.
///
/// Private key handling stays with the caller.
pub trait RsaSha1Signer: Send + Sync {
    fn sign(&self, base_string: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct OAuth1Params {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub signature_method: SignatureMethod,
    pub token_key: Option<String>,
    pub token_secret: Option<String>,
    /// Required for [`SignatureMethod::RsaSha1`].
    pub rsa_signer: Option<Arc<dyn RsaSha1Signer>>,
    /// Defaults to `1.0`.
    pub version: Option<String>,
    pub realm: Option<String>,
    pub callback: Option<String>,
    pub verifier: Option<String>,
    /// Fixed timestamp; generated per request when absent.
    pub timestamp: Option<String>,
    /// Fixed nonce; generated per request when absent.
    pub nonce: Option<String>,
    /// Adds `oauth_body_hash` for non-form bodies.
    pub include_body_hash: bool,
}

impl OAuth1Params {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        signature_method: SignatureMethod,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            signature_method,
            token_key: None,
            token_secret: None,
            rsa_signer: None,
            version: None,
            realm: None,
            callback: None,
            verifier: None,
            timestamp: None,
            nonce: None,
            include_body_hash: false,
        }
    }

    pub fn with_token(mut self, key: impl Into<String>, secret: impl Into<String>) -> Self {
        self.token_key = Some(key.into());
        self.token_secret = Some(secret.into());
        self
    }

    pub fn with_rsa_signer(mut self, signer: Arc<dyn RsaSha1Signer>) -> Self {
        self.rsa_signer = Some(signer);
        self
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_nonce_and_timestamp(
        mut self,
        nonce: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        self.nonce = Some(nonce.into());
        self.timestamp = Some(timestamp.into());
        self
    }

    pub fn with_body_hash(mut self, include: bool) -> Self {
        self.include_body_hash = include;
        self
    }
}

impl fmt::Debug for OAuth1Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth1Params")
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("signature_method", &self.signature_method)
            .field("token_key", &self.token_key)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<redacted>"))
            .field("rsa_signer", &self.rsa_signer.is_some())
            .field("realm", &self.realm)
            .field("include_body_hash", &self.include_body_hash)
            .finish_non_exhaustive()
    }
}

/// Signs every request with an OAuth 1.0a `Authorization: OAuth ...` header.
#[derive(Clone, Debug)]
pub struct OAuth1Agent {
    params: OAuth1Params,
}

impl OAuth1Agent {
    pub fn new(params: OAuth1Params) -> Self {
        Self { params }
    }

    /// Builds the header value for one request.
    pub fn authorize(&self, method: &str, url: &str, body: Option<&Body>) -> Result<String> {
        let params = &self.params;
        let mut oauth: Vec<(String, String)> = vec![
            ("oauth_consumer_key".to_owned(), params.consumer_key.clone()),
            (
                "oauth_nonce".to_owned(),
                params
                    .nonce
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            ),
            (
                "oauth_signature_method".to_owned(),
                params.signature_method.as_str().to_owned(),
            ),
            (
                "oauth_timestamp".to_owned(),
                params.timestamp.clone().unwrap_or_else(unix_timestamp),
            ),
            (
                "oauth_version".to_owned(),
                params.version.clone().unwrap_or_else(|| "1.0".to_owned()),
            ),
        ];
        if let Some(token) = &params.token_key {
            oauth.push(("oauth_token".to_owned(), token.clone()));
        }
        if let Some(callback) = &params.callback {
            oauth.push(("oauth_callback".to_owned(), callback.clone()));
        }
        if let Some(verifier) = &params.verifier {
            oauth.push(("oauth_verifier".to_owned(), verifier.clone()));
        }

        let mut extra: Vec<(String, String)> = Vec::new();
        match body {
            Some(Body::Form(pairs)) => extra.extend(pairs.iter().cloned()),
            Some(other) if params.include_body_hash => {
                oauth.push(("oauth_body_hash".to_owned(), self.body_hash(&other.to_bytes())));
            }
            _ => {}
        }

        let base_string = signature_base_string(method, url, &oauth, &extra)?;
        let signature = self.sign(&base_string)?;
        oauth.push(("oauth_signature".to_owned(), signature));
        oauth.sort();

        let mut parts = Vec::with_capacity(oauth.len() + 1);
        if let Some(realm) = &params.realm {
            parts.push(format!("realm=\"{}\"", encode(realm)));
        }
        parts.extend(
            oauth
                .iter()
                .map(|(key, value)| format!("{}=\"{}\"", encode(key), encode(value))),
        );
        Ok(format!("OAuth {}", parts.join(", ")))
    }

    fn body_hash(&self, body: &[u8]) -> String {
        match self.params.signature_method {
            SignatureMethod::HmacSha256 => STANDARD.encode(Sha256::digest(body)),
            _ => STANDARD.encode(Sha1::digest(body)),
        }
    }

    fn signing_key(&self) -> String {
        let token_secret = self.params.token_secret.as_deref().unwrap_or_default();
        format!(
            "{}&{}",
            encode(&self.params.consumer_secret),
            encode(token_secret)
        )
    }

    fn sign(&self, base_string: &str) -> Result<String> {
        let key = self.signing_key();
        match self.params.signature_method {
            SignatureMethod::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
                    .map_err(|err| RequestError::SignatureMethod(err.to_string()))?;
                mac.update(base_string.as_bytes());
                Ok(STANDARD.encode(mac.finalize().into_bytes()))
            }
            SignatureMethod::HmacSha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                    .map_err(|err| RequestError::SignatureMethod(err.to_string()))?;
                mac.update(base_string.as_bytes());
                Ok(STANDARD.encode(mac.finalize().into_bytes()))
            }
            SignatureMethod::RsaSha1 => {
                let signer = self.params.rsa_signer.as_ref().ok_or_else(|| {
                    RequestError::SignatureMethod(
                        "RSA-SHA1 requires a private key signer".to_owned(),
                    )
                })?;
                Ok(STANDARD.encode(signer.sign(base_string.as_bytes())?))
            }
            SignatureMethod::Plaintext => Ok(key),
        }
    }
}

#[async_trait]
impl AuthAgent for OAuth1Agent {
    async fn header(&self, ctx: &AuthContext<'_>) -> Result<Option<String>> {
        self.authorize(ctx.method.as_str(), ctx.url, ctx.body)
            .map(Some)
    }
}

/// `METHOD&encoded-base-url&encoded-normalized-parameters` per RFC 5849 §3.4.1.
fn signature_base_string(
    method: &str,
    url: &str,
    oauth: &[(String, String)],
    extra: &[(String, String)],
) -> Result<String> {
    let parsed = Url::parse(url).map_err(|err| RequestError::InvalidUrl {
        url: url.to_owned(),
        message: err.to_string(),
    })?;

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(key, value)| (encode(&key), encode(&value)))
        .collect();
    pairs.extend(
        oauth
            .iter()
            .chain(extra)
            .map(|(key, value)| (encode(key), encode(value))),
    );
    pairs.sort();
    let normalized = pairs
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut base_url = parsed;
    base_url.set_query(None);
    base_url.set_fragment(None);

    Ok(format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(base_url.as_str()),
        encode(&normalized)
    ))
}

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
        .to_string()
}
