#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Declarative HTTP client dispatch for `ModKit`
//!
//! A declarative client describes each operation once, as a
//! [`CallDescription`]: target service, HTTP verb, URI template, parameter
//! roles and the expected return shape. The [`Dispatcher`] turns that
//! description into a real request:
//!
//! - resolves the service to a load-balanced transport through the
//!   [`ClientRegistry`] (one transport per service identifier, built once);
//! - expands the URI template and assembles headers and body with the
//!   [`RequestBuilder`];
//! - runs the exchange awaited, as a [`CallFuture`], or as a reply stream;
//! - on failure, invokes a fallback registered for the same operation.
//!
//! # Soft 404
//!
//! For `Value`, `Optional` and `Future` return shapes an HTTP 404 is **not**
//! an error: the call yields `null`, `None` or `Ok(None)`. A missing resource
//! and an empty body therefore look the same to the caller. Use the
//! `Response` shape when the status matters.
//!
//! # Example
//!
//! ```ignore
//! use modkit_http_dispatch::{
//!     CallDescription, ClientRegistry, DispatchConfig, Dispatcher, OperationKey, Param,
//!     ReturnShape,
//! };
//! use std::sync::Arc;
//!
//! let config = DispatchConfig::load(Some("dispatch.yaml".as_ref()))?;
//! let dispatcher = Dispatcher::builder(Arc::new(ClientRegistry::from_config(&config)?)).build();
//!
//! let user = dispatcher
//!     .invoke(
//!         CallDescription::new("users", OperationKey::new("UserApi", "get_user"))
//!             .get("/users/{id}")
//!             .param(Param::path("id", 42))
//!             .returns(ReturnShape::Optional),
//!     )
//!     .await?
//!     .json::<User>()?;
//! ```

pub mod balancer;
pub mod call;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod registry;
pub mod request;
pub mod stream;
pub mod transform;
pub mod transport;
pub mod uri;

pub use balancer::{
    DefaultLoadBalancerResolver, FixedLoadBalancer, LoadBalancer, LoadBalancerResolver,
    RoundRobinLoadBalancer, ServiceInstance, ServiceInstanceList, StaticServiceInstanceList,
};
pub use call::{
    APPLICATION_JSON, BodyKind, CallDescription, ClientOptions, Element, HttpMapping,
    OperationKey, Param, ParamRole, ReturnShape, ServiceId, StreamType,
};
pub use codec::{DeserializationFeature, JsonCodec, JsonFeatures, SerializationFeature};
pub use config::{
    ConfigError, DEFAULT_USER_AGENT, DispatchConfig, HttpClientConfig, ServiceConfig,
    TlsRootConfig, TransportSecurity,
};
pub use dispatcher::{CallHandler, Dispatcher, DispatcherBuilder, Outcome};
pub use error::{BoxError, DispatchError, TransportError};
pub use fallback::{Fallback, FallbackRegistry, ResolvedFallback};
pub use registry::{ClientRegistration, ClientRegistry};
pub use request::{RequestBody, RequestBuilder, ResolvedRequest, permits_body};
pub use stream::{CallFuture, CallResult, StreamConverter, StreamConverters};
pub use transform::{
    FallbackSupplier, ResultTransformer, ResultTransformerChain, StreamFallbackTransformer,
};
pub use transport::{
    BlockingHttpClient, HttpClient, HttpClientFactory, HttpResponse, HyperClientFactory,
    HyperHttpClient, Reply, ReplyStream,
};
pub use uri::UriTemplate;
