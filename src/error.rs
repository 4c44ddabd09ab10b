//! Error types shared across the cluster and terminal layers.
//!
//! # Classification Strategy
//!
//! SSH connection failures are sorted into three kinds that the Session
//! Bridge reports back to the browser verbatim:
//!
//! 1. **Authentication failures (`auth_failed`, NOT retryable)**: wrong
//!    passwords, rejected keys, denied access. Retrying would only risk
//!    account lockouts.
//!
//! 2. **Unreachable (`unreachable`, usually retryable)**: connection refused,
//!    reset, no route to host, DNS hiccups.
//!
//! 3. **Timeout (`timeout`, NOT retried)**: the caller already spent its
//!    whole connect budget waiting.
//!
//! Authentication patterns take precedence: a message that mentions both a
//! connection problem and an authentication failure is an authentication
//! failure.

use poem::http::{StatusCode, header};
use poem::{Response, error::ResponseError};
use thiserror::Error;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "authentication rejected",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

const TIMEOUT_ERRORS: &[&str] = &["timed out", "timeout", "deadline has elapsed"];

/// Determines if an error message describes a transient failure.
///
/// Authentication failures are never retryable. Known connection errors are.
/// Anything else is retried unless it looks like an SSH protocol error, and
/// SSH errors that mention a timeout or a connect failure are retried too.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}

/// Failure to open an authenticated shell channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("connection timed out: {0}")]
    Timeout(String),
}

impl ConnectError {
    /// Sort a free-form error message from the SSH library into a kind.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
            ConnectError::AuthFailed(message)
        } else if TIMEOUT_ERRORS.iter().any(|p| lower.contains(p)) {
            ConnectError::Timeout(message)
        } else {
            ConnectError::Unreachable(message)
        }
    }

    /// Whether another connect attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectError::AuthFailed(_) | ConnectError::Timeout(_) => false,
            ConnectError::Unreachable(message) => is_retryable_error(message),
        }
    }

    /// Stable machine-readable reason sent to the browser.
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectError::AuthFailed(_) => "auth_failed",
            ConnectError::Unreachable(_) => "unreachable",
            ConnectError::Timeout(_) => "timeout",
        }
    }
}

/// I/O failure on an open shell channel. Always ends the session, never the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("channel I/O failed: {0}")]
    Io(String),
}

/// Why a redirect token was refused by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature does not match")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token was already used")]
    Replayed,
    #[error("token was issued for another node")]
    WrongNode,
}

impl TokenError {
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::BadSignature => "bad_signature",
            TokenError::Expired => "expired",
            TokenError::Replayed => "replayed",
            TokenError::WrongNode => "wrong_node",
        }
    }
}

/// Errors raised at the cluster HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("invalid cluster secret")]
    InvalidSecret,
    #[error("dashboard authentication required")]
    Unauthorized,
    #[error("invalid password")]
    InvalidPassword,
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("node is offline: {0}")]
    NodeOffline(String),
    #[error("malformed report: {0}")]
    MalformedReport(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("invalid connect request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("failed to build redirect: {0}")]
    Redirect(String),
}

impl ResponseError for ClusterError {
    fn status(&self) -> StatusCode {
        match self {
            ClusterError::InvalidSecret | ClusterError::InvalidPassword | ClusterError::Token(_) => {
                StatusCode::FORBIDDEN
            }
            ClusterError::Unauthorized => StatusCode::UNAUTHORIZED,
            ClusterError::NodeNotFound(_) | ClusterError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ClusterError::NodeOffline(_) => StatusCode::CONFLICT,
            ClusterError::MalformedReport(_) | ClusterError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ClusterError::Redirect(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn as_response(&self) -> Response
    where
        Self: std::error::Error + Send + Sync + 'static,
    {
        let body = serde_json::json!({ "error": self.to_string() }).to_string();
        let mut builder = Response::builder()
            .status(self.status())
            .content_type("application/json");
        if matches!(self, ClusterError::Unauthorized) {
            builder = builder.header(header::WWW_AUTHENTICATE, "Basic realm=\"Cluster Master\"");
        }
        builder.body(body)
    }
}

/// Invalid startup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{mode} mode requires {field}")]
    Missing {
        mode: &'static str,
        field: &'static str,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
