use std::{error::Error as StdError, fmt, io};

/// Connection-level failure codes that are always worth another attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// `EAI_AGAIN`: temporary DNS resolution failure.
    DnsRetry,
    /// `EHOSTDOWN`
    HostDown,
    /// `EHOSTUNREACH` (also used for an unreachable network).
    HostUnreachable,
    /// `ECONNABORTED`
    ConnectionAborted,
    /// `ECONNREFUSED`
    ConnectionRefused,
    /// `ECONNRESET`
    ConnectionReset,
    /// `EPIPE`
    BrokenPipe,
}

impl NetworkErrorKind {
    /// Returns the conventional errno-style code.
    pub fn code(self) -> &'static str {
        match self {
            Self::DnsRetry => "EAI_AGAIN",
            Self::HostDown => "EHOSTDOWN",
            Self::HostUnreachable => "EHOSTUNREACH",
            Self::ConnectionAborted => "ECONNABORTED",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::ConnectionReset => "ECONNRESET",
            Self::BrokenPipe => "EPIPE",
        }
    }

    /// Maps an I/O error onto a recognized transient code.
    pub fn from_io(err: &io::Error) -> Option<Self> {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionReset => Self::ConnectionReset,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::ConnectionAborted => Self::ConnectionAborted,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                Self::HostUnreachable
            }
            io::ErrorKind::NetworkDown => Self::HostDown,
            _ => {
                // getaddrinfo failures surface as uncategorized errors.
                let message = err.to_string();
                if message.contains("Temporary failure in name resolution")
                    || message.contains("EAI_AGAIN")
                {
                    Self::DnsRetry
                } else {
                    return None;
                }
            }
        };
        Some(kind)
    }
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure reported by a [`Transport`](crate::Transport) before any response arrived.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    kind: Option<NetworkErrorKind>,
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl TransportError {
    /// Creates an error without a recognized network code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error carrying a recognized transient network code.
    pub fn network(kind: NetworkErrorKind) -> Self {
        Self {
            kind: Some(kind),
            message: format!("network failure: {kind}"),
            source: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Recognized transient code, if any.
    pub fn kind(&self) -> Option<NetworkErrorKind> {
        self.kind
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let mut kind = None;
        let mut cause: Option<&(dyn StdError + 'static)> = err.source();
        while let Some(current) = cause {
            if let Some(io_err) = current.downcast_ref::<io::Error>() {
                kind = NetworkErrorKind::from_io(io_err);
                if kind.is_some() {
                    break;
                }
            }
            cause = current.source();
        }
        Self {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The transport failed before a response was received.
    #[error("{method} {url} failed on attempt {attempt}: {source}")]
    Network {
        method: String,
        url: String,
        /// One-based attempt that produced the failure.
        attempt: usize,
        #[source]
        source: TransportError,
    },
    /// Non-success HTTP status.
    #[error("Request failed: {status} {status_text} ({method} {url}, attempt {attempt})")]
    Http {
        method: String,
        url: String,
        status: u16,
        status_text: String,
        /// One-based attempt that produced the failure.
        attempt: usize,
    },
    /// Token endpoint answered without the fields an access token needs.
    #[error("malformed token response: {0}")]
    MalformedTokenResponse(String),
    /// Unsupported or unusable OAuth1 signature method.
    #[error("signature method error: {0}")]
    SignatureMethod(String),
    /// The request URL could not be resolved.
    #[error("invalid url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    /// Response body could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    /// True for connection-level failures carrying a recognized transient code.
    pub fn is_transient(&self) -> bool {
        self.network_kind().is_some()
    }

    /// Recognized transient code of a [`RequestError::Network`] failure.
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network { source, .. } => source.kind(),
            _ => None,
        }
    }

    /// HTTP status of a [`RequestError::Http`] failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Status text of a [`RequestError::Http`] failure.
    pub fn status_text(&self) -> Option<&str> {
        match self {
            Self::Http { status_text, .. } => Some(status_text.as_str()),
            _ => None,
        }
    }

    /// One-based attempt that produced a network or HTTP failure.
    pub fn attempt(&self) -> Option<usize> {
        match self {
            Self::Network { attempt, .. } | Self::Http { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{NetworkErrorKind, RequestError, TransportError};

    #[test]
    fn io_kinds_map_to_transient_codes() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(
            NetworkErrorKind::from_io(&reset),
            Some(NetworkErrorKind::ConnectionReset)
        );
        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(NetworkErrorKind::from_io(&pipe).map(|k| k.code()), Some("EPIPE"));
        let dns = io::Error::new(
            io::ErrorKind::Other,
            "failed to lookup address information: Temporary failure in name resolution",
        );
        assert_eq!(NetworkErrorKind::from_io(&dns), Some(NetworkErrorKind::DnsRetry));
        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(NetworkErrorKind::from_io(&other), None);
    }

    #[test]
    fn only_coded_network_errors_are_transient() {
        let transient = RequestError::Network {
            method: "GET".to_owned(),
            url: "http://h/".to_owned(),
            attempt: 1,
            source: TransportError::network(NetworkErrorKind::ConnectionRefused),
        };
        assert!(transient.is_transient());

        let opaque = RequestError::Network {
            method: "GET".to_owned(),
            url: "http://h/".to_owned(),
            attempt: 1,
            source: TransportError::new("tls handshake failed"),
        };
        assert!(!opaque.is_transient());
    }

    #[test]
    fn http_error_message_carries_context() {
        let err = RequestError::Http {
            method: "POST".to_owned(),
            url: "http://h/x".to_owned(),
            status: 503,
            status_text: "Service Unavailable".to_owned(),
            attempt: 3,
        };
        let message = err.to_string();
        assert!(message.contains("503 Service Unavailable"));
        assert!(message.contains("POST http://h/x"));
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.attempt(), Some(3));
    }
}
