//! Error types for HTTP protocol handling.
//!
//! Three layers:
//!
//! - [`ParseError`] — anything that goes wrong while reading and interpreting
//!   a request. Most variants map to an HTTP status code the engine answers
//!   with before closing or continuing; a few (oversized header block, raw
//!   I/O failure) make the engine close without writing anything.
//! - [`SendError`] — failures while serializing or writing a response.
//! - [`HandlerError`] — what handlers return on failure: either a typed HTTP
//!   status (with an optional user-visible message) or an arbitrary error
//!   that the engine turns into a 500.
//!
//! [`HttpError`] is the top-level union used at the connection boundary.

use http::StatusCode;
use std::error::Error;
use std::io;
use thiserror::Error;

/// The top-level error type for a connection.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Errors from request parsing and body reading
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    /// Errors from response serialization and writing
    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    /// A handler error propagated out of the engine (debug configurations only)
    #[error("handler error: {source}")]
    HandlerError {
        #[from]
        source: HandlerError,
    },
}

/// Errors raised while parsing and reading an HTTP request.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The header block exceeds the configured maximum size.
    ///
    /// The engine closes the connection without writing a response.
    #[error("header block of {current_size} bytes exceeds the limit of {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    /// Number of header fields exceeds the supported maximum
    #[error("header count exceeds the limit of {max_num}")]
    TooManyHeaders { max_num: usize },

    /// Malformed request line or header field
    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    /// The request line names an HTTP version other than 1.0 or 1.1
    #[error("unsupported http version")]
    UnsupportedVersion,

    /// The request line names a method other than GET, HEAD or POST
    #[error("unsupported http method: {method}")]
    UnsupportedMethod { method: String },

    /// Invalid request target
    #[error("invalid request uri")]
    InvalidUri,

    /// Invalid Content-Length header
    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    /// A request body was signalled but its size cannot be determined
    #[error("request body requires a content-length")]
    LengthRequired,

    /// The request body exceeds the configured maximum size
    #[error("request body of {current_size} bytes exceeds the limit of {max_size}")]
    BodyTooLarge { current_size: u64, max_size: u64 },

    /// The POST body carries a content type the engine cannot parse
    #[error("unsupported request content type: {content_type}")]
    UnsupportedMediaType { content_type: String },

    /// An Expect header with a token other than 100-continue
    #[error("unsupported expectation: {expectation}")]
    UnsupportedExpect { expectation: String },

    /// Invalid request body
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// I/O error during parsing
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn unsupported_method<S: ToString>(method: S) -> Self {
        Self::UnsupportedMethod { method: method.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn body_too_large(current_size: u64, max_size: u64) -> Self {
        Self::BodyTooLarge { current_size, max_size }
    }

    pub fn unsupported_media_type<S: ToString>(content_type: S) -> Self {
        Self::UnsupportedMediaType { content_type: content_type.to_string() }
    }

    pub fn unsupported_expect<S: ToString>(expectation: S) -> Self {
        Self::UnsupportedExpect { expectation: expectation.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status code an error response for this failure should carry.
    ///
    /// `None` means the connection is closed without writing anything: either
    /// the peer blew the header limit (answering would require having read the
    /// request), or the transport itself failed.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::TooLargeHeader { .. } | Self::Io { .. } => None,
            Self::UnsupportedMethod { .. } => Some(StatusCode::NOT_IMPLEMENTED),
            Self::UnsupportedVersion => Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED),
            Self::LengthRequired => Some(StatusCode::LENGTH_REQUIRED),
            Self::BodyTooLarge { .. } => Some(StatusCode::PAYLOAD_TOO_LARGE),
            Self::UnsupportedExpect { .. } => Some(StatusCode::EXPECTATION_FAILED),
            Self::TooManyHeaders { .. }
            | Self::InvalidHeader { .. }
            | Self::InvalidUri
            | Self::InvalidContentLength { .. }
            | Self::UnsupportedMediaType { .. }
            | Self::InvalidBody { .. } => Some(StatusCode::BAD_REQUEST),
        }
    }
}

/// Errors raised while serializing and writing an HTTP response.
#[derive(Error, Debug)]
pub enum SendError {
    /// Invalid response body
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    /// The status code forbids a body but one was provided
    #[error("status {status} must not carry a body")]
    BodyForbidden { status: StatusCode },

    /// I/O error during sending
    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn body_forbidden(status: StatusCode) -> Self {
        Self::BodyForbidden { status }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// The error type handlers fail with.
///
/// A handler that wants a specific HTTP status answers with
/// [`HandlerError::status`]; anything else becomes a 500 through the
/// [`From`] impl for boxed errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A failure with an explicit HTTP status and optional user message
    #[error("{status}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Status { status: StatusCode, message: Option<String> },

    /// Any other failure; rendered as a 500
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl HandlerError {
    /// A failure carrying the given HTTP status.
    pub fn status(status: StatusCode) -> Self {
        Self::Status { status, message: None }
    }

    /// Wraps an arbitrary error; the engine renders it as a 500.
    pub fn other<E: Into<Box<dyn Error + Send + Sync>>>(e: E) -> Self {
        Self::Other(e.into())
    }

    /// A failure carrying the given HTTP status and a user-visible message.
    pub fn with_message<S: ToString>(status: StatusCode, message: S) -> Self {
        Self::Status { status, message: Some(message.to_string()) }
    }

    /// The explicit HTTP status, when the handler supplied one.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Other(_) => None,
        }
    }

    /// The user-visible message, when the handler supplied one.
    pub fn user_message(&self) -> Option<&str> {
        match self {
            Self::Status { message, .. } => message.as_deref(),
            Self::Other(_) => None,
        }
    }
}

impl From<io::Error> for HandlerError {
    fn from(e: io::Error) -> Self {
        Self::Other(e.into())
    }
}
