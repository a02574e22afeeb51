//! Statically-typed description of one client operation invocation.
//!
//! A [`CallDescription`] is produced by a binding step (hand-written or
//! generated) for every call made through a declarative client. The dispatcher
//! only ever looks at this value; it never inspects runtime metadata.
//!
//! ```ignore
//! let call = CallDescription::new("users", OperationKey::new("UserApi", "get_user"))
//!     .get("/users/{id}")
//!     .param(Param::path("id", "42"))
//!     .returns(ReturnShape::Optional);
//! ```

use std::fmt;
use std::sync::Arc;

use http::Method;
use serde_json::Value;

use crate::codec::JsonFeatures;

/// Default media type requested when an operation declares none.
pub const APPLICATION_JSON: &str = "application/json";

/// Ordered list of strings naming a target service.
///
/// Used as the registry key, so two identifiers with the same segments in the
/// same order always share one client registration.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ServiceId(Arc<[String]>);

impl ServiceId {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The first identifier; the one used for endpoint resolution.
    #[must_use]
    pub fn primary(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }
}

impl From<&str> for ServiceId {
    fn from(id: &str) -> Self {
        Self::new([id])
    }
}

impl From<String> for ServiceId {
    fn from(id: String) -> Self {
        Self::new([id])
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{self}]")
    }
}

/// Identity of a logical operation: declaring type, name and argument types.
///
/// Fallback implementations are registered under the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub declaring_type: String,
    pub name: String,
    pub argument_types: Vec<String>,
}

impl OperationKey {
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
            argument_types: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_argument_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argument_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Same operation signature, declared on another type.
    #[must_use]
    pub fn on_type(&self, declaring_type: &str) -> Self {
        Self {
            declaring_type: declaring_type.to_owned(),
            name: self.name.clone(),
            argument_types: self.argument_types.clone(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.declaring_type,
            self.name,
            self.argument_types.join(", ")
        )
    }
}

/// How a body parameter should be merged into URI variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// A plain mapping: every field, null or not, is a candidate variable.
    Fields,
    /// A structured value: only its non-null properties are candidates.
    Object,
}

/// Role of a parameter in request assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRole {
    /// URI variable when the template names it, implicit body field otherwise.
    Implicit,
    /// URI variable only; never aggregated into a body.
    Path,
    /// Request header; `None` derives the name by hyphenating the parameter name.
    Header(Option<String>),
    /// The whole request body.
    Body(BodyKind),
}

/// One named argument of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub role: ParamRole,
    pub value: Value,
}

impl Param {
    pub fn new(name: impl Into<String>, role: ParamRole, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            role,
            value: value.into(),
        }
    }

    pub fn implicit(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, ParamRole::Implicit, value)
    }

    pub fn path(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, ParamRole::Path, value)
    }

    pub fn header(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, ParamRole::Header(None), value)
    }

    pub fn header_named(
        name: impl Into<String>,
        header: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self::new(name, ParamRole::Header(Some(header.into())), value)
    }

    /// Structured body, typically a serialized struct.
    pub fn body(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, ParamRole::Body(BodyKind::Object), value)
    }

    /// Mapping body: all of its fields take part in URI expansion.
    pub fn body_fields(name: impl Into<String>, fields: serde_json::Map<String, Value>) -> Self {
        Self::new(name, ParamRole::Body(BodyKind::Fields), Value::Object(fields))
    }

    /// Serializes `value` into a structured body parameter.
    ///
    /// # Errors
    /// Returns the serializer error if `value` cannot be represented as JSON.
    pub fn serialized_body<T: serde::Serialize>(
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::body(name, serde_json::to_value(value)?))
    }
}

/// Element type wrapped by a future or stream return shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    /// Full response wrapper (status, headers, raw body).
    Response,
    /// Nothing; the response body is not decoded.
    NoContent,
    /// Decoded JSON body.
    Body,
}

/// Name of a caller-side stream type, resolved through
/// [`StreamConverters`](crate::StreamConverters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamType(String);

impl StreamType {
    /// Multi-item stream, passed through as-is.
    pub const STREAM: &'static str = "stream";
    /// Exactly one item; completing empty is a conversion error.
    pub const SINGLE: &'static str = "single";
    /// Zero or one item.
    pub const MAYBE: &'static str = "maybe";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the caller expects back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnShape {
    /// Decoded body; a 404 yields JSON `null`.
    Value,
    /// Decoded body; a 404 yields `None`.
    Optional,
    /// Full response wrapper.
    Response,
    /// Nothing.
    NoContent,
    /// Single-value future over the given element.
    Future(Element),
    /// Stream of elements converted to a caller-side stream type.
    Stream {
        stream_type: StreamType,
        element: Element,
    },
}

impl ReturnShape {
    pub fn stream(stream_type: impl Into<StreamType>, element: Element) -> Self {
        Self::Stream {
            stream_type: stream_type.into(),
            element,
        }
    }

    /// `true` for shapes served by a non-blocking exchange.
    #[must_use]
    pub fn is_non_blocking(&self) -> bool {
        matches!(self, Self::Future(_) | Self::Stream { .. })
    }
}

/// HTTP verb and URI template of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMapping {
    pub method: Method,
    pub uri: String,
}

/// Client-level options shared by every operation of one declarative client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOptions {
    /// Explicit context path; wins over a path-like service identifier.
    pub path: Option<String>,
    /// Codec customization applied when the client's transport is created.
    pub features: JsonFeatures,
}

/// Everything the dispatcher needs to perform one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallDescription {
    pub service: ServiceId,
    pub client: ClientOptions,
    pub operation: OperationKey,
    /// `None` when the operation is not an HTTP operation at all.
    pub mapping: Option<HttpMapping>,
    pub params: Vec<Param>,
    /// Media types sent as `Accept` on non-blocking exchanges.
    pub consumes: Vec<String>,
    pub returns: ReturnShape,
}

impl CallDescription {
    pub fn new(service: impl Into<ServiceId>, operation: OperationKey) -> Self {
        Self {
            service: service.into(),
            client: ClientOptions::default(),
            operation,
            mapping: None,
            params: Vec::new(),
            consumes: Vec::new(),
            returns: ReturnShape::Value,
        }
    }

    #[must_use]
    pub fn mapping(mut self, method: Method, uri: impl Into<String>) -> Self {
        self.mapping = Some(HttpMapping {
            method,
            uri: uri.into(),
        });
        self
    }

    #[must_use]
    pub fn get(self, uri: impl Into<String>) -> Self {
        self.mapping(Method::GET, uri)
    }

    #[must_use]
    pub fn post(self, uri: impl Into<String>) -> Self {
        self.mapping(Method::POST, uri)
    }

    #[must_use]
    pub fn put(self, uri: impl Into<String>) -> Self {
        self.mapping(Method::PUT, uri)
    }

    #[must_use]
    pub fn patch(self, uri: impl Into<String>) -> Self {
        self.mapping(Method::PATCH, uri)
    }

    #[must_use]
    pub fn delete(self, uri: impl Into<String>) -> Self {
        self.mapping(Method::DELETE, uri)
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn params(mut self, params: impl IntoIterator<Item = Param>) -> Self {
        self.params.extend(params);
        self
    }

    #[must_use]
    pub fn consumes(mut self, media_type: impl Into<String>) -> Self {
        self.consumes.push(media_type.into());
        self
    }

    #[must_use]
    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.returns = shape;
        self
    }

    #[must_use]
    pub fn context_path(mut self, path: impl Into<String>) -> Self {
        self.client.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn features(mut self, features: JsonFeatures) -> Self {
        self.client.features = features;
        self
    }

    /// Value of the `Accept` header for content-negotiated exchanges.
    #[must_use]
    pub fn accept_header(&self) -> String {
        if self.consumes.is_empty() {
            APPLICATION_JSON.to_owned()
        } else {
            self.consumes.join(", ")
        }
    }
}
