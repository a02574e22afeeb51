#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Dispatcher behavior over a scripted in-memory transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use http::{Method, StatusCode};
use modkit_http_dispatch::{
    CallDescription, CallHandler, ClientRegistry, DefaultLoadBalancerResolver, DispatchError,
    Dispatcher, DispatcherBuilder, Element, FallbackRegistry, HttpClient, HttpClientFactory,
    HttpResponse, JsonCodec, LoadBalancer, OperationKey, Outcome, Param, Reply, ReplyStream,
    RequestBody, ResolvedRequest, ReturnShape, ServiceId, StaticServiceInstanceList,
    StreamFallbackTransformer, StreamType, TransportError, fallback,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

type Handler = dyn Fn(&ResolvedRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

struct ScriptedClient {
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<ResolvedRequest>>>,
}

impl ScriptedClient {
    fn call(&self, request: ResolvedRequest) -> BoxFuture<'static, Result<HttpResponse, TransportError>> {
        let handler = Arc::clone(&self.handler);
        let seen = Arc::clone(&self.seen);
        async move {
            seen.lock().push(request.clone());
            handler(&request)
        }
        .boxed()
    }
}

async fn respond(
    response: BoxFuture<'static, Result<HttpResponse, TransportError>>,
) -> Result<Reply, DispatchError> {
    Ok(Reply::Response(response.await?))
}

async fn decode(
    response: BoxFuture<'static, Result<HttpResponse, TransportError>>,
) -> Result<Option<Reply>, DispatchError> {
    let response = response.await?;
    if response.body.is_empty() {
        return Ok(None);
    }
    let body: Value = response.json().map_err(TransportError::from)?;
    Ok(Some(Reply::Body(body)))
}

impl HttpClient for ScriptedClient {
    fn exchange(&self, request: ResolvedRequest) -> ReplyStream {
        stream::once(respond(self.call(request))).boxed()
    }

    fn retrieve(&self, request: ResolvedRequest) -> ReplyStream {
        stream::once(decode(self.call(request)))
            .filter_map(|item| async move { item.transpose() })
            .boxed()
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct ScriptedFactory {
    handler: Arc<Handler>,
    seen: Arc<Mutex<Vec<ResolvedRequest>>>,
    created: AtomicUsize,
}

impl HttpClientFactory for ScriptedFactory {
    fn create(
        &self,
        _service: &ServiceId,
        _balancer: Arc<dyn LoadBalancer>,
        _codec: JsonCodec,
    ) -> Result<Arc<dyn HttpClient>, TransportError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        Ok(Arc::new(ScriptedClient {
            handler: Arc::clone(&self.handler),
            seen: Arc::clone(&self.seen),
        }))
    }
}

struct Harness {
    dispatcher: Dispatcher,
    factory: Arc<ScriptedFactory>,
}

impl Harness {
    fn new<F>(handler: F) -> Self
    where
        F: Fn(&ResolvedRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Self::with(handler, |builder| builder)
    }

    fn with<F>(
        handler: F,
        configure: impl FnOnce(DispatcherBuilder) -> DispatcherBuilder,
    ) -> Self
    where
        F: Fn(&ResolvedRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        let factory = Arc::new(ScriptedFactory {
            handler: Arc::new(handler),
            seen: Arc::new(Mutex::new(Vec::new())),
            created: AtomicUsize::new(0),
        });
        let resolver = DefaultLoadBalancerResolver::new()
            .with_local_server(url::Url::parse("http://127.0.0.1:8080").unwrap())
            .with_list(Arc::new(StaticServiceInstanceList::new(
                "users",
                [url::Url::parse("http://users.local").unwrap()],
            )));
        let registry = Arc::new(ClientRegistry::new(
            Arc::new(resolver),
            Arc::clone(&factory) as Arc<dyn HttpClientFactory>,
        ));
        Self {
            dispatcher: configure(Dispatcher::builder(registry)).build(),
            factory,
        }
    }

    fn requests(&self) -> Vec<ResolvedRequest> {
        self.factory.seen.lock().clone()
    }

    fn created(&self) -> usize {
        self.factory.created.load(Ordering::SeqCst)
    }
}

fn json_response(status: StatusCode, body: &Value) -> HttpResponse {
    HttpResponse::new(status).with_body(serde_json::to_vec(body).unwrap())
}

fn status_error(code: u16) -> TransportError {
    TransportError::Status {
        status: StatusCode::from_u16(code).unwrap(),
        body_preview: String::new(),
        content_type: None,
    }
}

fn get_user() -> CallDescription {
    CallDescription::new("users", OperationKey::new("UserClient", "get_user").with_argument_types(["i64"]))
        .get("/users/{id}")
        .param(Param::implicit("id", 42))
}

fn with_fallback(value: Value) -> FallbackRegistry {
    let mut fallbacks = FallbackRegistry::new();
    fallbacks
        .declare_interfaces("UserClient", ["UserApi"])
        .register(
            OperationKey::new("UserApi", "get_user").with_argument_types(["i64"]),
            fallback::from_fn(move |_| {
                let value = value.clone();
                async move { Ok::<_, anyhow::Error>(Reply::Body(value)) }
            }),
        );
    fallbacks
}

#[tokio::test]
async fn awaited_value_expands_path_without_body() {
    let harness = Harness::new(|_| Ok(json_response(StatusCode::OK, &json!({"id": 42, "name": "Ann"}))));

    let value = harness
        .dispatcher
        .invoke(get_user())
        .await
        .unwrap()
        .into_value()
        .unwrap();

    assert_eq!(value["name"], "Ann");
    let requests = harness.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, Method::GET);
    assert_eq!(requests[0].uri, "/users/42");
    assert!(requests[0].body.is_none());
    assert!(requests[0].headers.get(http::header::ACCEPT).is_none());
}

#[tokio::test]
async fn post_aggregates_implicit_body() {
    let harness = Harness::new(|_| Ok(HttpResponse::new(StatusCode::CREATED)));
    let call = CallDescription::new("users", OperationKey::new("UserClient", "create"))
        .post("/users")
        .param(Param::implicit("name", "Bob"))
        .param(Param::header("requestId", "r-1"))
        .returns(ReturnShape::NoContent);

    let outcome = harness.dispatcher.invoke(call).await.unwrap();
    assert!(matches!(outcome, Outcome::Unit));

    let request = &harness.requests()[0];
    assert_eq!(request.uri, "/users");
    assert_eq!(request.headers["request-id"], "r-1");
    let Some(RequestBody::Fields(fields)) = &request.body else {
        panic!("expected implicit body");
    };
    assert_eq!(Value::Object(fields.clone()), json!({"name": "Bob"}));
}

#[tokio::test]
async fn soft_not_found_for_value_and_optional() {
    let harness = Harness::new(|_| Err(status_error(404)));

    let optional = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Optional))
        .await
        .unwrap();
    assert!(matches!(optional, Outcome::Optional(None)));

    let value = harness.dispatcher.invoke(get_user()).await.unwrap();
    assert!(matches!(value, Outcome::Value(Value::Null)));
}

#[tokio::test]
async fn awaited_failure_without_fallback_surfaces_original_error() {
    let harness = Harness::new(|_| Err(status_error(503)));

    let err = harness.dispatcher.invoke(get_user()).await.unwrap_err();
    assert_eq!(err.to_string(), "HTTP 503 Service Unavailable: ");
}

#[tokio::test]
async fn awaited_failure_with_fallback_on_interface() {
    let harness = Harness::with(
        |_| Err(status_error(503)),
        |b| b.fallbacks(with_fallback(json!({"id": 0, "cached": true}))),
    );

    let user = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Optional))
        .await
        .unwrap()
        .into_optional()
        .unwrap()
        .unwrap();
    assert_eq!(user["cached"], true);
}

#[tokio::test]
async fn fallback_failure_is_wrapped() {
    let mut fallbacks = FallbackRegistry::new();
    fallbacks.register(
        OperationKey::new("UserClient", "delete"),
        fallback::from_fn(|_| async { Err::<Reply, _>(anyhow::anyhow!("offline")) }),
    );
    let harness = Harness::with(|_| Err(status_error(500)), |b| b.fallbacks(fallbacks));

    let call = CallDescription::new("users", OperationKey::new("UserClient", "delete"))
        .delete("/users/{id}")
        .param(Param::path("id", 1))
        .returns(ReturnShape::NoContent);
    let err = harness.dispatcher.invoke(call).await.unwrap_err();

    assert!(matches!(err, DispatchError::FallbackInvocation { .. }));
    assert_eq!(
        err.to_string(),
        "Error invoking fallback for type [UserClient]: offline"
    );
}

#[tokio::test]
async fn future_fallback_failure_is_wrapped() {
    let mut fallbacks = FallbackRegistry::new();
    fallbacks.register(
        OperationKey::new("UserClient", "get_user").with_argument_types(["i64"]),
        fallback::from_fn(|_| async { Err::<Reply, _>(anyhow::anyhow!("down")) }),
    );
    let harness = Harness::with(|_| Err(status_error(502)), |b| b.fallbacks(fallbacks));

    let err = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Future(Element::Body)))
        .await
        .unwrap()
        .into_future()
        .unwrap()
        .await
        .unwrap_err();

    assert!(matches!(
        &err,
        DispatchError::FallbackInvocation { declaring_type, .. } if declaring_type == "UserClient"
    ));
    assert_eq!(
        err.to_string(),
        "Error invoking fallback for type [UserClient]: down"
    );
}

#[tokio::test]
async fn response_shape_never_falls_back() {
    let harness = Harness::with(
        |_| Err(status_error(500)),
        |b| b.fallbacks(with_fallback(json!({}))),
    );

    let err = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Response))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "HTTP 500 Internal Server Error: ");
}

#[tokio::test]
async fn response_shape_returns_wrapper() {
    let harness = Harness::new(|_| Ok(json_response(StatusCode::OK, &json!([1, 2]))));
    let response = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Response))
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json::<Vec<u8>>().unwrap(), [1, 2]);
}

#[tokio::test]
async fn future_not_found_completes_empty() {
    let harness = Harness::new(|_| Err(status_error(404)));

    let future = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Future(Element::Body)))
        .await
        .unwrap()
        .into_future()
        .unwrap();

    assert!(future.await.unwrap().is_none());
}

#[tokio::test]
async fn future_body_sets_accept_and_completes_with_value() {
    let harness = Harness::new(|_| Ok(json_response(StatusCode::OK, &json!({"id": 42}))));

    let call = get_user()
        .consumes("application/json")
        .consumes("application/hal+json")
        .returns(ReturnShape::Future(Element::Body));
    let reply = harness
        .dispatcher
        .invoke(call)
        .await
        .unwrap()
        .into_future()
        .unwrap()
        .await
        .unwrap();

    assert_eq!(reply, Some(Reply::Body(json!({"id": 42}))));
    assert_eq!(
        harness.requests()[0].headers[http::header::ACCEPT],
        "application/json, application/hal+json"
    );
}

#[tokio::test]
async fn future_no_content_completes_with_none() {
    let harness = Harness::new(|_| Ok(json_response(StatusCode::OK, &json!({"ignored": true}))));
    let reply = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Future(Element::NoContent)))
        .await
        .unwrap()
        .into_future()
        .unwrap()
        .await
        .unwrap();
    assert!(reply.is_none());
    assert!(harness.requests()[0].headers.get(http::header::ACCEPT).is_none());
}

#[tokio::test]
async fn future_failure_uses_fallback_or_surfaces_error() {
    let harness = Harness::with(
        |_| Err(status_error(502)),
        |b| b.fallbacks(with_fallback(json!({"id": -1}))),
    );
    let reply = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Future(Element::Body)))
        .await
        .unwrap()
        .into_future()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(reply, Some(Reply::Body(json!({"id": -1}))));

    let harness = Harness::new(|_| Err(status_error(502)));
    let err = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::Future(Element::Body)))
        .await
        .unwrap()
        .into_future()
        .unwrap()
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "HTTP 502 Bad Gateway: ");
}

#[tokio::test]
async fn stream_shapes_convert_and_fall_back() {
    let harness = Harness::new(|_| Ok(json_response(StatusCode::OK, &json!([{"id": 1}]))));
    let items: Vec<_> = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::stream(StreamType::SINGLE, Element::Body)))
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 1);

    let harness = Harness::with(
        |_| Err(status_error(500)),
        |b| {
            b.fallbacks(with_fallback(json!({"from": "fallback"})))
                .transformer(Arc::new(StreamFallbackTransformer))
        },
    );
    let mut replies = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::stream(StreamType::STREAM, Element::Body)))
        .await
        .unwrap()
        .into_stream()
        .unwrap();
    assert_eq!(
        replies.next().await.unwrap().unwrap(),
        Reply::Body(json!({"from": "fallback"}))
    );
}

#[tokio::test]
async fn unsupported_stream_type() {
    let harness = Harness::new(|_| Ok(HttpResponse::new(StatusCode::OK)));
    let err = harness
        .dispatcher
        .invoke(get_user().returns(ReturnShape::stream("flux", Element::Body)))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnsupportedStreamType { stream_type } if stream_type == "flux"));
}

#[tokio::test]
async fn unknown_service_is_fatal() {
    let harness = Harness::with(
        |_| Ok(HttpResponse::new(StatusCode::OK)),
        |b| b.fallbacks(with_fallback(json!({}))),
    );
    let call = CallDescription::new("orders", OperationKey::new("UserClient", "get_user"))
        .get("/orders");
    let err = harness.dispatcher.invoke(call).await.unwrap_err();

    assert!(matches!(err, DispatchError::ServiceResolution { .. }));
    assert_eq!(
        err.to_string(),
        "Invalid service reference [orders] specified to client"
    );
    assert_eq!(harness.created(), 0);
}

#[tokio::test]
async fn context_path_from_path_like_service_and_explicit_option() {
    let harness = Harness::new(|_| Ok(HttpResponse::new(StatusCode::OK)));

    let call = CallDescription::new("/internal", OperationKey::new("Health", "check"))
        .get("/health")
        .returns(ReturnShape::NoContent);
    harness.dispatcher.invoke(call).await.unwrap();

    let call = CallDescription::new(ServiceId::new(["users", "v2"]), OperationKey::new("UserClient", "list"))
        .get("/users{?page}")
        .context_path("/api/v2")
        .param(Param::implicit("page", 3));
    harness.dispatcher.invoke(call).await.unwrap();

    let uris: Vec<String> = harness.requests().into_iter().map(|r| r.uri).collect();
    assert_eq!(uris, ["/internal/health", "/api/v2/users?page=3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_calls_construct_one_client() {
    let harness = Arc::new(Harness::new(|_| Ok(HttpResponse::new(StatusCode::OK))));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.dispatcher.invoke(get_user()).await.map(|_| ()) })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(harness.created(), 1);
    assert_eq!(harness.requests().len(), 16);
}

struct Local;

#[async_trait]
impl CallHandler for Local {
    async fn handle(&self, call: CallDescription) -> Result<Outcome, DispatchError> {
        Ok(Outcome::Value(json!(call.operation.name)))
    }
}

#[tokio::test]
async fn unmapped_calls_pass_through() {
    let harness = Harness::new(|_| Ok(HttpResponse::new(StatusCode::OK)));
    let call = CallDescription::new("users", OperationKey::new("UserClient", "to_string"));
    let outcome = harness.dispatcher.invoke(call.clone()).await.unwrap();
    assert!(matches!(outcome, Outcome::Proceed(c) if c == call));

    let harness = Harness::with(|_| Ok(HttpResponse::new(StatusCode::OK)), |b| b.next(Arc::new(Local)));
    let value = harness.dispatcher.invoke(call).await.unwrap().into_value().unwrap();
    assert_eq!(value, "to_string");
    assert_eq!(harness.created(), 0);
}

#[test]
fn invoke_blocking_runs_on_handle() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let harness = Harness::new(|_| Ok(json_response(StatusCode::OK, &json!({"id": 42}))));

    let value = harness
        .dispatcher
        .invoke_blocking(runtime.handle(), get_user())
        .unwrap()
        .json::<serde_json::Map<String, Value>>()
        .unwrap()
        .unwrap();
    assert_eq!(value["id"], 42);
}
