//! Invocation of declarative client operations.
//!
//! [`Dispatcher::invoke`] picks one of three invocation styles from the
//! declared [`ReturnShape`]:
//!
//! - awaited (`Value`, `Optional`, `Response`, `NoContent`): the exchange is
//!   driven to completion before returning;
//! - future (`Future`): the exchange runs on a spawned task and the caller gets
//!   a [`CallFuture`];
//! - stream (`Stream`): the lazy reply stream is converted to the declared
//!   stream type and threaded through the result transformers.
//!
//! A 404 answer is a *soft* failure for `Value`, `Optional` and `Future`
//! shapes: it yields `null`, `None` or `Ok(None)` instead of an error. Callers
//! cannot tell a missing resource apart from an empty body. Every other
//! transport failure gets one chance at a registered fallback, except for the
//! awaited `Response` shape, which always surfaces it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use http::header::{ACCEPT, HeaderValue};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::call::{CallDescription, Element, OperationKey, Param, ReturnShape, StreamType};
use crate::error::DispatchError;
use crate::fallback::{FallbackRegistry, ResolvedFallback};
use crate::registry::{ClientRegistration, ClientRegistry};
use crate::request::{RequestBuilder, ResolvedRequest};
use crate::stream::{CallFuture, Completion, StreamConverter, StreamConverters};
use crate::transform::{FallbackSupplier, ResultTransformer, ResultTransformerChain};
use crate::transport::{HttpResponse, Reply, ReplyStream};
use crate::uri::UriTemplate;

/// Result of one call, in the caller's declared shape.
pub enum Outcome {
    Value(Value),
    Optional(Option<Value>),
    Response(HttpResponse),
    Unit,
    Future(CallFuture),
    Stream(ReplyStream),
    /// The call has no HTTP mapping and no handler took it.
    Proceed(CallDescription),
}

impl Outcome {
    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] for shapes without a value.
    pub fn into_value(self) -> Result<Value, DispatchError> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Optional(value) => Ok(value.unwrap_or(Value::Null)),
            other => Err(DispatchError::conversion("value", other.kind())),
        }
    }

    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] for shapes without a value.
    pub fn into_optional(self) -> Result<Option<Value>, DispatchError> {
        match self {
            Self::Optional(value) => Ok(value),
            Self::Value(Value::Null) => Ok(None),
            Self::Value(value) => Ok(Some(value)),
            other => Err(DispatchError::conversion("optional", other.kind())),
        }
    }

    /// Deserializes the value; `None` when absent.
    ///
    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] when the value does not fit `T`.
    pub fn json<T: DeserializeOwned>(self) -> Result<Option<T>, DispatchError> {
        self.into_optional()?
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|e| DispatchError::conversion(std::any::type_name::<T>(), e.to_string()))
            })
            .transpose()
    }

    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] unless this is a response.
    pub fn into_response(self) -> Result<HttpResponse, DispatchError> {
        match self {
            Self::Response(response) => Ok(response),
            other => Err(DispatchError::conversion("response", other.kind())),
        }
    }

    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] unless this is a future.
    pub fn into_future(self) -> Result<CallFuture, DispatchError> {
        match self {
            Self::Future(future) => Ok(future),
            other => Err(DispatchError::conversion("future", other.kind())),
        }
    }

    /// # Errors
    /// [`DispatchError::UnsupportedConversion`] unless this is a stream.
    pub fn into_stream(self) -> Result<ReplyStream, DispatchError> {
        match self {
            Self::Stream(stream) => Ok(stream),
            other => Err(DispatchError::conversion("stream", other.kind())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Value(_) => "outcome is a value",
            Self::Optional(_) => "outcome is an optional value",
            Self::Response(_) => "outcome is a response",
            Self::Unit => "outcome is empty",
            Self::Future(_) => "outcome is a future",
            Self::Stream(_) => "outcome is a stream",
            Self::Proceed(_) => "call was not dispatched",
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Optional(value) => f.debug_tuple("Optional").field(value).finish(),
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Unit => f.write_str("Unit"),
            Self::Future(_) => f.write_str("Future(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Proceed(call) => f.debug_tuple("Proceed").field(&call.operation).finish(),
        }
    }
}

/// Next link for calls that carry no HTTP mapping.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, call: CallDescription) -> Result<Outcome, DispatchError>;
}

pub struct Dispatcher {
    registry: Arc<ClientRegistry>,
    fallbacks: Arc<FallbackRegistry>,
    transformers: ResultTransformerChain,
    converters: StreamConverters,
    next: Option<Arc<dyn CallHandler>>,
}

pub struct DispatcherBuilder {
    registry: Arc<ClientRegistry>,
    fallbacks: FallbackRegistry,
    transformers: ResultTransformerChain,
    converters: StreamConverters,
    next: Option<Arc<dyn CallHandler>>,
}

impl DispatcherBuilder {
    #[must_use]
    pub fn fallbacks(mut self, fallbacks: FallbackRegistry) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn ResultTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    #[must_use]
    pub fn stream_converter(
        mut self,
        stream_type: impl Into<String>,
        converter: Arc<dyn StreamConverter>,
    ) -> Self {
        self.converters.register(stream_type, converter);
        self
    }

    #[must_use]
    pub fn next(mut self, handler: Arc<dyn CallHandler>) -> Self {
        self.next = Some(handler);
        self
    }

    #[must_use]
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            registry: self.registry,
            fallbacks: Arc::new(self.fallbacks),
            transformers: self.transformers,
            converters: self.converters,
            next: self.next,
        }
    }
}

impl Dispatcher {
    #[must_use]
    pub fn builder(registry: Arc<ClientRegistry>) -> DispatcherBuilder {
        DispatcherBuilder {
            registry,
            fallbacks: FallbackRegistry::new(),
            transformers: ResultTransformerChain::new(),
            converters: StreamConverters::default(),
            next: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Performs `call` and converts the result to its declared shape.
    ///
    /// # Errors
    /// See [`DispatchError`]; a 404 is never an error for `Value`, `Optional`
    /// and `Future` shapes.
    pub async fn invoke(&self, call: CallDescription) -> Result<Outcome, DispatchError> {
        let Some(mapping) = call.mapping.clone() else {
            return match &self.next {
                Some(next) => next.handle(call).await,
                None => Ok(Outcome::Proceed(call)),
            };
        };

        let registration = self.registry.get_or_create(&call.service, &call.client)?;
        let template = operation_template(&registration.context_path, &mapping.uri);
        let request = RequestBuilder::new(&template).build(&mapping.method, &call.params);

        match call.returns.clone() {
            ReturnShape::Future(element) => {
                let replies = issue(&registration, &call, request, element);
                Ok(Outcome::Future(self.bridge(call, replies, element)))
            }
            ReturnShape::Stream {
                stream_type,
                element,
            } => {
                let replies = issue(&registration, &call, request, element);
                self.stream(&call, &stream_type, replies).map(Outcome::Stream)
            }
            ReturnShape::Response => {
                let response = registration.blocking().exchange(request).await;
                if let Err(err) = &response {
                    log_failure(&call, err);
                }
                response.map(Outcome::Response)
            }
            ReturnShape::NoContent => {
                match registration.blocking().exchange_discarding(request).await {
                    Ok(()) => Ok(Outcome::Unit),
                    Err(err) => self.recover(&call, err).await.map(|_| Outcome::Unit),
                }
            }
            ReturnShape::Value | ReturnShape::Optional => {
                let value = match registration.blocking().retrieve(request).await {
                    Ok(value) => value,
                    Err(err) if err.is_not_found() => Value::Null,
                    Err(err) => self.recover(&call, err).await?.into_value()?,
                };
                Ok(if call.returns == ReturnShape::Optional {
                    Outcome::Optional(Some(value).filter(|v| !v.is_null()))
                } else {
                    Outcome::Value(value)
                })
            }
        }
    }

    /// Runs [`invoke`](Self::invoke) to completion on `handle`.
    ///
    /// Must not be called from within an async context of that runtime.
    ///
    /// # Errors
    /// Same as [`invoke`](Self::invoke).
    pub fn invoke_blocking(
        &self,
        handle: &tokio::runtime::Handle,
        call: CallDescription,
    ) -> Result<Outcome, DispatchError> {
        handle.block_on(self.invoke(call))
    }

    async fn recover(&self, call: &CallDescription, err: DispatchError) -> Result<Reply, DispatchError> {
        log_failure(call, &err);
        if !err.is_recoverable() {
            return Err(err);
        }
        match self.fallbacks.find(&call.operation) {
            Some(fallback) => {
                tracing::debug!(
                    operation = %call.operation,
                    fallback = %fallback.registered_on(),
                    "resolved fallback for failed call"
                );
                fallback.invoke(&call.params).await
            }
            None => Err(err),
        }
    }

    fn stream(
        &self,
        call: &CallDescription,
        stream_type: &StreamType,
        replies: ReplyStream,
    ) -> Result<ReplyStream, DispatchError> {
        let converted = self.converters.convert(stream_type, replies)?;
        let fallbacks = Arc::clone(&self.fallbacks);
        let operation = call.operation.clone();
        let supplier: FallbackSupplier = Arc::new(move || fallbacks.find(&operation));
        let params: Arc<[Param]> = call.params.clone().into();
        Ok(self.transformers.apply(converted, &supplier, &params))
    }

    /// Drives `replies` on a spawned task and completes the returned future
    /// exactly once.
    fn bridge(&self, call: CallDescription, replies: ReplyStream, element: Element) -> CallFuture {
        let (completion, future) = Completion::new();
        let fallbacks = Arc::clone(&self.fallbacks);

        tokio::spawn(async move {
            let mut replies = replies.take(1);
            while let Some(item) = replies.next().await {
                if completion.is_abandoned() {
                    return;
                }
                match item {
                    Ok(reply) => {
                        if element != Element::NoContent {
                            completion.offer(reply);
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        completion.complete(Ok(None));
                        return;
                    }
                    Err(err) => {
                        log_failure(&call, &err);
                        let result = match fallbacks.find(&call.operation) {
                            Some(fallback) if err.is_recoverable() => {
                                fallback_reply(&call.operation, &fallback, &call.params).await
                            }
                            _ => Err(err),
                        };
                        completion.complete(result);
                        return;
                    }
                }
            }
            completion.complete(Ok(completion.buffered()));
        });

        future
    }
}

async fn fallback_reply(
    operation: &OperationKey,
    fallback: &ResolvedFallback,
    params: &[Param],
) -> Result<Option<Reply>, DispatchError> {
    tracing::debug!(
        operation = %operation,
        fallback = %fallback.registered_on(),
        "resolved fallback for failed call"
    );
    fallback.invoke(params).await.map(Some)
}

/// Method template nested under the registration's context path.
fn operation_template(context_path: &str, uri: &str) -> UriTemplate {
    let base = UriTemplate::parse(if context_path.is_empty() { "/" } else { context_path });
    if uri == "/" { base } else { base.nest(uri) }
}

/// Starts the non-blocking exchange that matches the element type.
fn issue(
    registration: &ClientRegistration,
    call: &CallDescription,
    mut request: ResolvedRequest,
    element: Element,
) -> ReplyStream {
    if element != Element::NoContent
        && let Ok(accept) = HeaderValue::from_str(&call.accept_header())
    {
        request.headers.insert(ACCEPT, accept);
    }
    match element {
        Element::Response | Element::NoContent => registration.client.exchange(request),
        Element::Body => registration.client.retrieve(request),
    }
}

fn log_failure(call: &CallDescription, err: &DispatchError) {
    match err {
        DispatchError::Transport(transport) => match transport.status() {
            Some(status) => tracing::error!(
                service = %call.service,
                operation = %call.operation,
                status = status.as_u16(),
                error = %err,
                "client received HTTP error response"
            ),
            None => tracing::error!(
                service = %call.service,
                operation = %call.operation,
                error = %err,
                "client request failed"
            ),
        },
        _ => tracing::debug!(operation = %call.operation, error = %err, "call failed"),
    }
}
