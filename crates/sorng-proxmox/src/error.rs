//! Error types for the Proxmox provisioning crate.

use std::fmt;

/// Categorised error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxmoxErrorKind {
    /// VM config still carries a `lock` after the retry budget was spent
    Locked,
    /// Remote config is missing a required field or has an unexpected shape
    MalformedData,
    /// Caller-supplied spec / device is unusable for the requested action
    Validation,
    /// Lock wait aborted through the cancellation token
    Cancelled,
    /// API endpoint unreachable
    ConnectionError,
    /// Token rejected (401)
    AuthenticationError,
    /// Resource not found (404)
    NotFound,
    /// Permission denied (403)
    AccessDenied,
    /// HTTP / API error with status code
    ApiError(u16),
    /// Timeout
    Timeout,
    /// JSON parse / deserialization error
    ParseError,
    /// Generic
    Other,
}

/// Crate error type carrying a kind + human-readable message.
#[derive(Debug, Clone)]
pub struct ProxmoxError {
    pub kind: ProxmoxErrorKind,
    pub message: String,
}

impl ProxmoxError {
    pub fn new(kind: ProxmoxErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn locked(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::Locked, msg)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::MalformedData, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::Validation, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::Cancelled, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::ConnectionError, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::AuthenticationError, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::NotFound, msg)
    }

    pub fn api(status: u16, msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::ApiError(status), msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::ParseError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ProxmoxErrorKind::Timeout, msg)
    }

    /// Whether this error came from the transport rather than from the
    /// codec or the lock protocol.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.kind,
            ProxmoxErrorKind::ConnectionError
                | ProxmoxErrorKind::AuthenticationError
                | ProxmoxErrorKind::NotFound
                | ProxmoxErrorKind::AccessDenied
                | ProxmoxErrorKind::ApiError(_)
                | ProxmoxErrorKind::Timeout
        )
    }
}

impl fmt::Display for ProxmoxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ProxmoxError {}

impl From<ProxmoxError> for String {
    fn from(e: ProxmoxError) -> String {
        e.to_string()
    }
}

impl From<reqwest::Error> for ProxmoxError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("HTTP timeout: {e}"))
        } else if e.is_connect() {
            Self::connection(format!("Connection failed: {e}"))
        } else {
            Self::new(ProxmoxErrorKind::Other, format!("HTTP error: {e}"))
        }
    }
}

impl From<serde_json::Error> for ProxmoxError {
    fn from(e: serde_json::Error) -> Self {
        Self::parse(format!("JSON parse error: {e}"))
    }
}

/// Convenience alias.
pub type ProxmoxResult<T> = Result<T, ProxmoxError>;
