use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::net::retry::{Classify, FailureClass};
use crate::orchestrator::SyncResult;

pub type Result<T, E = PosError> = std::result::Result<T, E>;

/// Low-level transport failure kinds we care about when deciding to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Reset,
    Timeout,
    Dns,
    Refused,
    BrokenPipe,
    Other,
}

impl TransportKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, TransportKind::Other)
    }

    fn from_io(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Some(TransportKind::Reset)
            }
            io::ErrorKind::TimedOut => Some(TransportKind::Timeout),
            io::ErrorKind::ConnectionRefused => Some(TransportKind::Refused),
            io::ErrorKind::BrokenPipe => Some(TransportKind::BrokenPipe),
            _ => None,
        }
    }
}

/// Errors surfaced by a single provider API call.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("http {status}: {body}")]
    Http {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("transport ({kind:?}): {message}")]
    Transport { kind: TransportKind, message: String },
    #[error("decode: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ApiError::Decode(err.to_string());
        }
        if err.is_builder() {
            return ApiError::InvalidRequest(err.to_string());
        }
        let kind = transport_kind(&err);
        ApiError::Transport {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Walk the source chain looking for an io::Error or a resolver failure.
fn transport_kind(err: &reqwest::Error) -> TransportKind {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if let Some(kind) = TransportKind::from_io(io_err.kind()) {
                return kind;
            }
        }
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return TransportKind::Dns;
        }
        source = cause.source();
    }
    if err.is_timeout() {
        TransportKind::Timeout
    } else if err.is_connect() {
        TransportKind::Refused
    } else {
        TransportKind::Other
    }
}

impl Classify for ApiError {
    fn classify(&self) -> FailureClass {
        match self {
            ApiError::Http { status, .. } => match status {
                429 | 500 | 502 | 503 | 504 => FailureClass::RetryableStatus(*status),
                _ => FailureClass::Fatal,
            },
            ApiError::Transport { kind, .. } if kind.is_transient() => FailureClass::Transport,
            _ => FailureClass::Fatal,
        }
    }
}

impl Classify for sqlx::Error {
    fn classify(&self) -> FailureClass {
        match self {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => FailureClass::Transport,
            _ => FailureClass::Fatal,
        }
    }
}

/// Closed taxonomy every caller switches on.
#[derive(Error, Debug)]
pub enum PosError {
    /// Bad credentials, missing scopes or a deactivated connection.
    #[error("auth error: {0}")]
    Auth(String),
    /// Access token expired; needs an external refresh before retrying.
    #[error("token error: {0}")]
    Token(String),
    #[error("sync error: {message}")]
    Sync {
        message: String,
        retryable: bool,
        result: Option<Box<SyncResult>>,
    },
    #[error("config error: {0}")]
    Config(String),
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

impl PosError {
    pub fn sync(message: impl Into<String>) -> Self {
        PosError::Sync {
            message: message.into(),
            retryable: true,
            result: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            PosError::Auth(_) | PosError::Config(_) | PosError::NotFound(_) => false,
            // Only after the collaborator refreshes the token.
            PosError::Token(_) => false,
            PosError::Sync { retryable, .. } => *retryable,
            PosError::RateLimit { .. } => true,
            PosError::Storage(err) => err.classify().is_retryable(),
        }
    }

    /// Short tag used in structured logs and serialized error entries.
    pub fn kind(&self) -> &'static str {
        match self {
            PosError::Auth(_) => "auth",
            PosError::Token(_) => "token",
            PosError::Sync { .. } => "sync",
            PosError::Config(_) => "config",
            PosError::RateLimit { .. } => "rate_limit",
            PosError::Storage(_) => "storage",
            PosError::NotFound(_) => "not_found",
        }
    }

    /// Partial run attached to a sync failure, if any.
    pub fn sync_result(&self) -> Option<&SyncResult> {
        match self {
            PosError::Sync { result, .. } => result.as_deref(),
            _ => None,
        }
    }
}

impl From<ApiError> for PosError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Http { status: 401, body, .. } => PosError::Token(body),
            ApiError::Http { status: 403, body, .. } => PosError::Auth(body),
            ApiError::Http {
                status: 429,
                body,
                retry_after,
            } => PosError::RateLimit {
                message: body,
                retry_after,
            },
            ApiError::InvalidRequest(msg) => PosError::Config(msg),
            other => {
                let retryable = other.classify().is_retryable();
                PosError::Sync {
                    message: other.to_string(),
                    retryable,
                    result: None,
                }
            }
        }
    }
}
