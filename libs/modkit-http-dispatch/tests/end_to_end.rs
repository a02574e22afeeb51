#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Full dispatch path over the hyper transport against a mock server.

use std::sync::Arc;

use futures::StreamExt;
use httpmock::prelude::*;
use modkit_http_dispatch::{
    CallDescription, ClientRegistry, DispatchConfig, DispatchError, Dispatcher, Element,
    FallbackRegistry, OperationKey, Param, Reply, ReturnShape, ServiceId, StreamType, fallback,
};
use serde_json::json;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("modkit_http_dispatch=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

fn config_for(server: &MockServer) -> DispatchConfig {
    DispatchConfig::from_yaml_str(&format!(
        "http:\n  request_timeout: 5s\n  transport: allow_insecure_http\n\
         local_server_url: {base}\n\
         services:\n  users:\n    urls: [{base}]\n",
        base = server.base_url()
    ))
    .unwrap()
}

fn dispatcher(server: &MockServer, fallbacks: FallbackRegistry) -> Dispatcher {
    init_tracing();
    let registry = ClientRegistry::from_config(&config_for(server)).unwrap();
    Dispatcher::builder(Arc::new(registry))
        .fallbacks(fallbacks)
        .build()
}

#[tokio::test]
async fn get_with_query_and_header() {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET)
            .path("/users")
            .query_param("page", "2")
            .header("x-tenant-id", "acme");
        then.status(200).json_body(json!([{"id": 1}, {"id": 2}]));
    });

    let call = CallDescription::new("users", OperationKey::new("UserApi", "list"))
        .get("/users{?page}")
        .param(Param::implicit("page", 2))
        .param(Param::header("xTenantId", "acme"));
    let users = dispatcher(&server, FallbackRegistry::new())
        .invoke(call)
        .await
        .unwrap()
        .json::<Vec<serde_json::Value>>()
        .unwrap()
        .unwrap();

    m.assert();
    assert_eq!(users.len(), 2);
}

#[tokio::test]
async fn put_sends_body_fields_merged_into_path() {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(PUT)
            .path("/users/7")
            .json_body(json!({"id": 7, "name": "Eve"}));
        then.status(204);
    });

    let call = CallDescription::new("users", OperationKey::new("UserApi", "update"))
        .put("/users/{id}")
        .param(Param::body("user", json!({"id": 7, "name": "Eve"})))
        .returns(ReturnShape::NoContent);
    let outcome = dispatcher(&server, FallbackRegistry::new())
        .invoke(call)
        .await
        .unwrap();

    m.assert();
    assert!(matches!(outcome, modkit_http_dispatch::Outcome::Unit));
}

#[tokio::test]
async fn not_found_is_soft_for_optional_and_future() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/users/404");
        then.status(404).body("missing");
    });
    let dispatcher = dispatcher(&server, FallbackRegistry::new());
    let call = CallDescription::new("users", OperationKey::new("UserApi", "get"))
        .get("/users/{id}")
        .param(Param::path("id", 404));

    let optional = dispatcher
        .invoke(call.clone().returns(ReturnShape::Optional))
        .await
        .unwrap()
        .into_optional()
        .unwrap();
    assert!(optional.is_none());

    let future = dispatcher
        .invoke(call.clone().returns(ReturnShape::Future(Element::Body)))
        .await
        .unwrap()
        .into_future()
        .unwrap();
    assert!(future.await.unwrap().is_none());

    let err = dispatcher
        .invoke(call.returns(ReturnShape::Response))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "HTTP 404 Not Found: missing");
}

#[tokio::test]
async fn server_error_uses_fallback() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/users/1");
        then.status(503);
    });

    let mut fallbacks = FallbackRegistry::new();
    fallbacks.register(
        OperationKey::new("UserApi", "get"),
        fallback::from_fn(|params| async move {
            Ok::<_, anyhow::Error>(Reply::Body(json!({"id": params[0].value, "stale": true})))
        }),
    );
    let call = CallDescription::new("users", OperationKey::new("UserApi", "get"))
        .get("/users/{id}")
        .param(Param::path("id", 1));

    let user = dispatcher(&server, fallbacks)
        .invoke(call)
        .await
        .unwrap()
        .into_value()
        .unwrap();
    assert_eq!(user, json!({"id": 1, "stale": true}));
}

#[tokio::test]
async fn local_server_context_path_and_maybe_stream() {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET)
            .path("/internal/status")
            .header("accept", "application/json");
        then.status(200).json_body(json!({"ok": true}));
    });

    let call = CallDescription::new("/internal", OperationKey::new("Status", "get"))
        .get("/status")
        .returns(ReturnShape::stream(StreamType::MAYBE, Element::Body));
    let items: Vec<_> = dispatcher(&server, FallbackRegistry::new())
        .invoke(call)
        .await
        .unwrap()
        .into_stream()
        .unwrap()
        .collect()
        .await;

    m.assert();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap(), &Reply::Body(json!({"ok": true})));
}

#[tokio::test]
async fn unresolvable_service_and_closed_registry() {
    let server = MockServer::start();
    let dispatcher = dispatcher(&server, FallbackRegistry::new());

    let err = dispatcher
        .invoke(CallDescription::new("billing", OperationKey::new("Billing", "get")).get("/"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::ServiceResolution { .. }));

    let users = ServiceId::from("users");
    server.mock(|when, then| {
        when.method(GET).path("/ping");
        then.status(200);
    });
    dispatcher
        .invoke(CallDescription::new(users.clone(), OperationKey::new("UserApi", "ping")).get("/ping"))
        .await
        .unwrap();
    assert!(dispatcher.registry().contains(&users));

    dispatcher.registry().close().unwrap();
    assert!(dispatcher.registry().is_empty());
}
