use heck::ToKebabCase;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde_json::{Map, Value};

use crate::call::{BodyKind, Param, ParamRole};
use crate::uri::UriTemplate;

/// Body of a resolved request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Ordered field map, from an explicit mapping body or implicit aggregation.
    Fields(Map<String, Value>),
    /// Arbitrary structured value.
    Object(Value),
}

impl RequestBody {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Object(Value::Null))
    }

    fn from_param(kind: BodyKind, value: &Value) -> Self {
        match (kind, value) {
            (BodyKind::Fields, Value::Object(fields)) => Self::Fields(fields.clone()),
            (_, value) => Self::Object(value.clone()),
        }
    }

    /// Candidate URI variables carried by the body.
    fn variables(&self) -> Map<String, Value> {
        match self {
            Self::Fields(fields) => fields.clone(),
            Self::Object(Value::Object(props)) => props
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Self::Object(_) => Map::new(),
        }
    }
}

/// A concrete request, relative to whichever endpoint the load balancer picks.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub method: Method,
    /// Expanded path and query.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

impl ResolvedRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// `true` for verbs whose requests may carry a body.
#[must_use]
pub fn permits_body(method: &Method) -> bool {
    [
        Method::POST,
        Method::PUT,
        Method::PATCH,
        Method::DELETE,
        Method::OPTIONS,
    ]
    .contains(method)
}

/// Assembles a [`ResolvedRequest`] from typed call parameters.
pub struct RequestBuilder<'a> {
    template: &'a UriTemplate,
}

impl<'a> RequestBuilder<'a> {
    #[must_use]
    pub fn new(template: &'a UriTemplate) -> Self {
        Self { template }
    }

    /// Classifies `params` and expands the template.
    ///
    /// The first body parameter wins and ends classification; later
    /// parameters still feed URI variables but never headers or the implicit
    /// body.
    #[must_use]
    pub fn build(&self, method: &Method, params: &[Param]) -> ResolvedRequest {
        let variables = self.template.variables();
        let mut headers = HeaderMap::new();
        let mut implicit = Map::new();
        let mut body: Option<RequestBody> = None;

        for param in params {
            match &param.role {
                ParamRole::Body(kind) => {
                    body = Some(RequestBody::from_param(*kind, &param.value));
                    break;
                }
                ParamRole::Header(explicit) => {
                    let name = explicit
                        .clone()
                        .unwrap_or_else(|| param.name.to_kebab_case());
                    insert_header(&mut headers, &name, &param.value);
                }
                ParamRole::Implicit if !variables.contains(&param.name.as_str()) => {
                    implicit.insert(param.name.clone(), param.value.clone());
                }
                ParamRole::Implicit | ParamRole::Path => {}
            }
        }

        let mut values: Map<String, Value> = params
            .iter()
            .filter(|p| matches!(p.role, ParamRole::Implicit | ParamRole::Path))
            .map(|p| (p.name.clone(), p.value.clone()))
            .collect();

        let mut request = ResolvedRequest {
            method: method.clone(),
            uri: String::new(),
            headers,
            body: None,
        };

        if !permits_body(method) {
            request.uri = self.template.expand(&values);
            return request;
        }

        if body.is_none() && !implicit.is_empty() {
            body = Some(RequestBody::Fields(implicit));
        }

        let satisfied = variables
            .iter()
            .all(|name| values.get(*name).is_some_and(|v| !v.is_null()));
        if let Some(body) = &body
            && !satisfied
        {
            values.extend(body.variables());
        }

        request.uri = self.template.expand(&values);
        request.body = body.filter(|b| !b.is_null());
        request
    }
}

/// Header text for a parameter value; `None` when it has no string form.
fn header_text(value: &Value) -> Option<String> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    match value {
        Value::Array(items) => items
            .iter()
            .map(scalar)
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.join(",")),
        other => scalar(other),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &Value) {
    let Some(text) = header_text(value) else {
        tracing::trace!(header = name, "header value has no string form, omitted");
        return;
    };
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(&text),
    ) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
        }
        _ => tracing::debug!(header = name, "invalid header, omitted"),
    }
}
