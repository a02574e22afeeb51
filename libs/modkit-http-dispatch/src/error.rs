use std::time::Duration;
use thiserror::Error;

use crate::call::ServiceId;

/// Boxed error used for failures whose concrete type belongs to a lower layer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures raised by an [`HttpClient`](crate::HttpClient) while exchanging a request.
///
/// Every variant is recoverable from the dispatcher's point of view: the call
/// gets one chance at a registered fallback before the error reaches the caller.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// HTTP status >= 400
    #[error("HTTP {status}: {body_preview}")]
    Status {
        status: http::StatusCode,
        body_preview: String,
        content_type: Option<String>,
    },

    /// Single request attempt timed out
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Network level failure (connect, reset, DNS, ...)
    #[error("Transport error: {0}")]
    Network(#[source] BoxError),

    /// TLS setup failure
    #[error("TLS error: {0}")]
    Tls(#[source] BoxError),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Request body encoding or response body decoding failed
    #[error("JSON codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// The selected endpoint plus request path is not a valid URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri { url: String, reason: String },

    /// Invalid URL scheme for transport security configuration
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme { scheme: String, reason: String },

    /// The load balancer had nothing to hand out
    #[error("No available instance for service '{service}'")]
    NoAvailableInstance { service: String },

    /// The transport was closed by its registry
    #[error("HTTP client for [{service}] is closed")]
    Closed { service: String },
}

impl TransportError {
    /// HTTP status carried by the error, if the server answered at all.
    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(http::StatusCode::NOT_FOUND)
    }
}

/// Errors surfaced by [`Dispatcher::invoke`](crate::Dispatcher::invoke).
///
/// Only [`DispatchError::Transport`] is eligible for fallback handling; every
/// other variant is fatal to the call.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    /// No load balancer matches the logical service identifier
    #[error("Invalid service reference [{service}] specified to client")]
    ServiceResolution { service: ServiceId },

    /// Non-2xx response or network failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// No converter is registered for the declared stream type
    #[error("Cannot convert response stream to unsupported stream type: {stream_type}")]
    UnsupportedStreamType { stream_type: String },

    /// The fallback implementation itself failed
    #[error("Error invoking fallback for type [{declaring_type}]: {source}")]
    FallbackInvocation {
        declaring_type: String,
        #[source]
        source: BoxError,
    },

    /// The response could not be converted to the declared shape
    #[error("Cannot convert response to {target}: {reason}")]
    UnsupportedConversion { target: String, reason: String },

    /// The task driving a non-blocking call went away before completing it
    #[error("Call was interrupted before completion")]
    Interrupted,
}

impl DispatchError {
    pub(crate) fn conversion(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsupportedConversion {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// `true` for an HTTP 404 answer from the remote service.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_not_found())
    }

    /// `true` when a registered fallback may stand in for the failed call.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
