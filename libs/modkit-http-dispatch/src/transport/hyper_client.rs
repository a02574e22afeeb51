use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, future, stream};
use http::header::{ACCEPT, CONTENT_TYPE, HeaderValue, USER_AGENT};
use http_body_util::{BodyExt, Full, Limited};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use tower::timeout::TimeoutLayer;
use tower::{ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;

use super::{HttpClient, HttpClientFactory, HttpResponse, Reply, ReplyStream, tls};
use crate::balancer::LoadBalancer;
use crate::call::{APPLICATION_JSON, ServiceId};
use crate::codec::JsonCodec;
use crate::config::{HttpClientConfig, TransportSecurity};
use crate::error::{DispatchError, TransportError};
use crate::request::ResolvedRequest;

/// Maximum number of body bytes kept in [`TransportError::Status`] previews.
const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

type PooledClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// [`HttpClient`] over a pooled hyper client.
///
/// Every request picks an endpoint from the load balancer, then runs through
/// `Timeout -> Decompression -> hyper`.
#[derive(Clone)]
pub struct HyperHttpClient {
    inner: Arc<Inner>,
}

struct Inner {
    service: String,
    balancer: Arc<dyn LoadBalancer>,
    codec: JsonCodec,
    client: PooledClient,
    user_agent: HeaderValue,
    timeout: Duration,
    max_body_size: usize,
    security: TransportSecurity,
    closed: AtomicBool,
}

impl HyperHttpClient {
    /// # Errors
    /// [`TransportError::Tls`] when the connector cannot be built, or
    /// [`TransportError::RequestBuild`] for an invalid user agent.
    pub fn new(
        service: &ServiceId,
        balancer: Arc<dyn LoadBalancer>,
        codec: JsonCodec,
        config: &HttpClientConfig,
    ) -> Result<Self, TransportError> {
        let security = effective_security(service, config.transport);

        let https = tls::https_connector(config.tls_roots, security)?;
        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host);
        let client = builder.build::<_, Full<Bytes>>(https);

        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| TransportError::RequestBuild(e.into()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                service: service.to_string(),
                balancer,
                codec,
                client,
                user_agent,
                timeout: config.request_timeout,
                max_body_size: config.max_body_size,
                security,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl Inner {
    fn target(&self, path: &str) -> Result<http::Uri, TransportError> {
        let instance = self.balancer.select()?;
        let base = instance.url.as_str().trim_end_matches('/');
        let url = if path.is_empty() || path.starts_with('/') || path.starts_with('?') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };

        let uri: http::Uri = url.parse().map_err(|e: http::uri::InvalidUri| {
            TransportError::InvalidUri {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;

        let scheme = uri.scheme_str().unwrap_or_default();
        match (scheme, self.security) {
            ("https", _) | ("http", TransportSecurity::AllowInsecureHttp) => Ok(uri),
            ("http", _) => Err(TransportError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "plain HTTP requires TransportSecurity::AllowInsecureHttp".to_owned(),
            }),
            _ => Err(TransportError::InvalidScheme {
                scheme: scheme.to_owned(),
                reason: "only http and https are supported".to_owned(),
            }),
        }
    }

    async fn send(&self, request: ResolvedRequest) -> Result<HttpResponse, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed {
                service: self.service.clone(),
            });
        }

        let uri = self.target(&request.uri)?;
        let body = match &request.body {
            Some(body) => self.codec.encode(body)?,
            None => Bytes::new(),
        };
        let has_body = request.body.is_some();

        let mut builder = http::Request::builder().method(request.method).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers);
            if !headers.contains_key(USER_AGENT) {
                headers.insert(USER_AGENT, self.user_agent.clone());
            }
            if has_body && !headers.contains_key(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
            }
        }
        let http_request = builder.body(Full::new(body))?;

        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(self.timeout))
            .layer(DecompressionLayer::new())
            .service(self.client.clone());

        let response = service
            .oneshot(http_request)
            .await
            .map_err(|e| map_tower_error(e, self.timeout))?;

        let (parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<http_body_util::LengthLimitError>() {
                    TransportError::BodyTooLarge {
                        limit: self.max_body_size,
                    }
                } else {
                    TransportError::Network(e)
                }
            })?
            .to_bytes();

        if parts.status.is_client_error() || parts.status.is_server_error() {
            let preview = &body[..body.len().min(ERROR_BODY_PREVIEW_LIMIT)];
            return Err(TransportError::Status {
                status: parts.status,
                body_preview: String::from_utf8_lossy(preview).into_owned(),
                content_type: parts
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned),
            });
        }

        Ok(HttpResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

fn map_tower_error(err: tower::BoxError, timeout: Duration) -> TransportError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return TransportError::Timeout(timeout);
    }
    match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(other) => TransportError::Network(other),
    }
}

impl HttpClient for HyperHttpClient {
    fn exchange(&self, request: ResolvedRequest) -> ReplyStream {
        let inner = Arc::clone(&self.inner);
        stream::once(async move {
            inner
                .send(request)
                .await
                .map(Reply::Response)
                .map_err(DispatchError::from)
        })
        .boxed()
    }

    fn retrieve(&self, mut request: ResolvedRequest) -> ReplyStream {
        let inner = Arc::clone(&self.inner);
        if !request.headers.contains_key(ACCEPT) {
            request
                .headers
                .insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        }
        stream::once(async move {
            let response = inner.send(request).await?;
            let body = inner.codec.decode(&response.body).map_err(TransportError::from)?;
            Ok::<_, DispatchError>(body.map(Reply::Body))
        })
        .filter_map(|item| future::ready(item.transpose()))
        .boxed()
    }

    fn close(&self) -> Result<(), TransportError> {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(service = %self.inner.service, "HTTP client closed");
        }
        Ok(())
    }
}

/// Builds a [`HyperHttpClient`] per registration from shared settings.
#[derive(Debug, Clone, Default)]
pub struct HyperClientFactory {
    config: HttpClientConfig,
}

impl HyperClientFactory {
    #[must_use]
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }
}

impl HttpClientFactory for HyperClientFactory {
    fn create(
        &self,
        service: &ServiceId,
        balancer: Arc<dyn LoadBalancer>,
        codec: JsonCodec,
    ) -> Result<Arc<dyn HttpClient>, TransportError> {
        Ok(Arc::new(HyperHttpClient::new(
            service,
            balancer,
            codec,
            &self.config,
        )?))
    }
}

/// Plain HTTP is honored in debug builds or with the `allow-insecure-http`
/// feature; release builds fall back to TLS only.
fn effective_security(service: &ServiceId, requested: TransportSecurity) -> TransportSecurity {
    if requested != TransportSecurity::AllowInsecureHttp {
        return requested;
    }
    if cfg!(any(debug_assertions, feature = "allow-insecure-http")) {
        tracing::warn!(
            %service,
            "insecure HTTP enabled (TransportSecurity::AllowInsecureHttp); \
             use only for testing with mock servers"
        );
        TransportSecurity::AllowInsecureHttp
    } else {
        tracing::warn!(
            %service,
            "insecure HTTP requested but not compiled in; enforcing TLS"
        );
        TransportSecurity::TlsOnly
    }
}
