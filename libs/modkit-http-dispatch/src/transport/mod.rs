//! Transport abstraction used by the dispatcher.
//!
//! An [`HttpClient`] exposes two lazy, non-blocking exchanges: `exchange`
//! yields the full response, `retrieve` yields the decoded body (or nothing
//! for an empty body). [`BlockingHttpClient`] awaits either to completion.

use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::balancer::LoadBalancer;
use crate::call::ServiceId;
use crate::codec::JsonCodec;
use crate::error::{DispatchError, TransportError};
use crate::request::ResolvedRequest;

mod hyper_client;
mod response;
mod tls;

pub use hyper_client::{HyperClientFactory, HyperHttpClient};
pub use response::HttpResponse;

/// One item emitted by a transport stream or produced by a fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Response(HttpResponse),
    Body(Value),
}

impl Reply {
    /// The decoded body; a response is decoded as JSON, `null` when it has none.
    ///
    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] when a response body is not JSON.
    pub fn into_value(self) -> Result<Value, DispatchError> {
        match self {
            Self::Body(value) => Ok(value),
            Self::Response(response) if response.body.is_empty() => Ok(Value::Null),
            Self::Response(response) => response
                .json()
                .map_err(|e| DispatchError::conversion("value", e.to_string())),
        }
    }

    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] for a bare body.
    pub fn into_response(self) -> Result<HttpResponse, DispatchError> {
        match self {
            Self::Response(response) => Ok(response),
            Self::Body(_) => Err(DispatchError::conversion(
                "response",
                "reply carries a decoded body only",
            )),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Body(value)
    }
}

impl From<HttpResponse> for Reply {
    fn from(response: HttpResponse) -> Self {
        Self::Response(response)
    }
}

/// Lazy stream of replies; nothing is sent until it is polled.
pub type ReplyStream = BoxStream<'static, Result<Reply, DispatchError>>;

/// A load-balanced HTTP transport bound to one logical service.
pub trait HttpClient: Send + Sync {
    /// Emits the full response; statuses >= 400 are emitted as errors.
    fn exchange(&self, request: ResolvedRequest) -> ReplyStream;

    /// Emits the decoded body; an empty body completes without an item.
    fn retrieve(&self, request: ResolvedRequest) -> ReplyStream;

    /// Releases the transport. Later exchanges fail with
    /// [`TransportError::Closed`].
    ///
    /// # Errors
    /// Implementation-specific shutdown failures.
    fn close(&self) -> Result<(), TransportError>;
}

/// Awaits exchanges of an [`HttpClient`] to completion.
#[derive(Clone)]
pub struct BlockingHttpClient {
    client: Arc<dyn HttpClient>,
}

impl BlockingHttpClient {
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self { client }
    }

    /// # Errors
    /// The transport failure, or a conversion error if no response came back.
    pub async fn exchange(&self, request: ResolvedRequest) -> Result<HttpResponse, DispatchError> {
        match self.client.exchange(request).next().await {
            Some(reply) => reply?.into_response(),
            None => Err(DispatchError::conversion(
                "response",
                "transport completed without a response",
            )),
        }
    }

    /// Exchanges and drops the response.
    ///
    /// # Errors
    /// The transport failure.
    pub async fn exchange_discarding(&self, request: ResolvedRequest) -> Result<(), DispatchError> {
        let mut replies = self.client.exchange(request);
        while let Some(reply) = replies.next().await {
            reply?;
        }
        Ok(())
    }

    /// Retrieves the decoded body; `null` when the body was empty.
    ///
    /// # Errors
    /// The transport failure.
    pub async fn retrieve(&self, request: ResolvedRequest) -> Result<Value, DispatchError> {
        match self.client.retrieve(request).next().await {
            Some(reply) => reply?.into_value(),
            None => Ok(Value::Null),
        }
    }
}

/// Creates the transport of a new client registration.
pub trait HttpClientFactory: Send + Sync {
    /// # Errors
    /// Transport setup failures (TLS, invalid settings).
    fn create(
        &self,
        service: &ServiceId,
        balancer: Arc<dyn LoadBalancer>,
        codec: JsonCodec,
    ) -> Result<Arc<dyn HttpClient>, TransportError>;
}
