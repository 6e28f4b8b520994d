use std::{fmt, time::Duration};

use crate::{FieldError, ProblemDetail};

/// Coarse classification of a network-level failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportErrorKind {
    /// Connection could not be established.
    Connect,
    /// The physical attempt exceeded its timeout.
    Timeout,
    /// The request could not be sent.
    Request,
    /// The response body could not be read.
    Body,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Request => "request",
            Self::Body => "body",
        })
    }
}

/// Error type returned by this crate.
///
/// Every HTTP status variant keeps the original status code and, when the
/// server sent one, the parsed RFC 7807 problem detail.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Invalid or incomplete client configuration, including missing credentials.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A credential source marked as required could not be read.
    #[error("credential error: {0}")]
    Credential(String),
    /// Network or request execution error.
    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        source: Option<reqwest::Error>,
    },
    /// HTTP 400.
    #[error("bad request ({status}): {message}")]
    BadRequest {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 401.
    #[error("unauthorized ({status}): {message}")]
    Unauthorized {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 403.
    #[error("forbidden ({status}): {message}")]
    Forbidden {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 404.
    #[error("not found ({status}): {message}")]
    NotFound {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 409.
    #[error("conflict ({status}): {message}")]
    Conflict {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 422 with per-field validation errors.
    #[error("validation failed ({status}): {message}")]
    Validation {
        status: u16,
        message: String,
        errors: Vec<FieldError>,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 429.
    #[error("rate limited ({status}): {message}")]
    RateLimited {
        status: u16,
        message: String,
        /// Parsed `Retry-After` hint.
        retry_after: Option<Duration>,
        problem: Option<ProblemDetail>,
    },
    /// Any other 4xx status.
    #[error("client error {status}: {message}")]
    Client {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// HTTP 5xx, surfaced after the retry budget is spent.
    #[error("server error {status}: {message}")]
    Server {
        status: u16,
        message: String,
        problem: Option<ProblemDetail>,
    },
    /// A non-success status outside the 4xx/5xx ranges.
    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },
    /// Response body did not match the expected shape.
    ///
    /// `null_fields` lists every path holding a JSON `null`, which is the
    /// usual reason a typed field fails to decode.
    #[error("parse error: {message}")]
    Parse {
        message: String,
        null_fields: Vec<String>,
    },
}

impl ApiError {
    /// Builds a transport failure without an underlying `reqwest` error.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Request
        };
        Self::Transport {
            kind,
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// HTTP status code carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::BadRequest { status, .. }
            | Self::Unauthorized { status, .. }
            | Self::Forbidden { status, .. }
            | Self::NotFound { status, .. }
            | Self::Conflict { status, .. }
            | Self::Validation { status, .. }
            | Self::RateLimited { status, .. }
            | Self::Client { status, .. }
            | Self::Server { status, .. }
            | Self::UnexpectedStatus { status, .. } => Some(*status),
            Self::Configuration(_)
            | Self::Credential(_)
            | Self::Transport { .. }
            | Self::Parse { .. } => None,
        }
    }

    /// Structured problem detail parsed from the error body, if any.
    pub fn problem_detail(&self) -> Option<&ProblemDetail> {
        match self {
            Self::BadRequest { problem, .. }
            | Self::Unauthorized { problem, .. }
            | Self::Forbidden { problem, .. }
            | Self::NotFound { problem, .. }
            | Self::Conflict { problem, .. }
            | Self::Validation { problem, .. }
            | Self::RateLimited { problem, .. }
            | Self::Client { problem, .. }
            | Self::Server { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }

    /// Null-field report attached to a parse failure.
    pub fn null_fields(&self) -> &[String] {
        match self {
            Self::Parse { null_fields, .. } => null_fields,
            _ => &[],
        }
    }

    /// Server-supplied retry hint of a rate-limit error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns `true` for network-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Returns `true` for 4xx statuses.
    pub fn is_client_error(&self) -> bool {
        self.status().is_some_and(|status| (400..500).contains(&status))
    }

    /// Returns `true` for 5xx statuses.
    pub fn is_server_error(&self) -> bool {
        self.status().is_some_and(|status| (500..600).contains(&status))
    }

    /// Returns `true` when repeating the call may succeed: network failures,
    /// rate limiting and server errors.
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || self.status() == Some(429) || self.is_server_error()
    }
}
