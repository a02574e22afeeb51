//! Per-service client registrations.
//!
//! - Key = [`ServiceId`], the ordered identifier list of a declarative client.
//! - Value = one transport plus the context path its operations are nested under.
//! - The first call for a key resolves the load balancer and builds the
//!   transport while holding the map entry, so concurrent first calls share a
//!   single construction. A failed construction stores nothing.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::balancer::{DefaultLoadBalancerResolver, LoadBalancerResolver};
use crate::call::{ClientOptions, ServiceId};
use crate::codec::JsonCodec;
use crate::config::{ConfigError, DispatchConfig};
use crate::error::{DispatchError, TransportError};
use crate::transport::{BlockingHttpClient, HttpClient, HttpClientFactory, HyperClientFactory};

/// Transport and context path shared by every operation of one client.
#[derive(Clone)]
pub struct ClientRegistration {
    pub client: Arc<dyn HttpClient>,
    pub context_path: String,
}

impl ClientRegistration {
    #[must_use]
    pub fn blocking(&self) -> BlockingHttpClient {
        BlockingHttpClient::new(Arc::clone(&self.client))
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("context_path", &self.context_path)
            .finish_non_exhaustive()
    }
}

pub struct ClientRegistry {
    clients: DashMap<ServiceId, ClientRegistration>,
    resolver: Arc<dyn LoadBalancerResolver>,
    factory: Arc<dyn HttpClientFactory>,
}

impl ClientRegistry {
    pub fn new(
        resolver: Arc<dyn LoadBalancerResolver>,
        factory: Arc<dyn HttpClientFactory>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            resolver,
            factory,
        }
    }

    /// Registry backed by [`DefaultLoadBalancerResolver`] and hyper transports.
    ///
    /// # Errors
    /// [`ConfigError::InvalidUrl`] for a malformed service or local server URL.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            Arc::new(DefaultLoadBalancerResolver::from_config(config)?),
            Arc::new(HyperClientFactory::new(config.http.clone())),
        ))
    }

    /// Returns the registration for `service`, creating it on first use.
    ///
    /// # Errors
    /// [`DispatchError::ServiceResolution`] when no load balancer matches, or
    /// the transport error raised while constructing the client.
    pub fn get_or_create(
        &self,
        service: &ServiceId,
        options: &ClientOptions,
    ) -> Result<ClientRegistration, DispatchError> {
        if let Some(existing) = self.clients.get(service) {
            return Ok(existing.clone());
        }

        match self.clients.entry(service.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let registration = self.create(service, options)?;
                entry.insert(registration.clone());
                Ok(registration)
            }
        }
    }

    fn create(
        &self,
        service: &ServiceId,
        options: &ClientOptions,
    ) -> Result<ClientRegistration, DispatchError> {
        let balancer =
            self.resolver
                .resolve(service)
                .ok_or_else(|| DispatchError::ServiceResolution {
                    service: service.clone(),
                })?;

        let context_path = context_path(service, options);
        let codec = JsonCodec::default().with_features(&options.features);
        let client = self.factory.create(service, balancer, codec)?;

        tracing::info!(%service, context_path = %context_path, "created HTTP client registration");
        Ok(ClientRegistration {
            client,
            context_path,
        })
    }

    /// Removes and closes the registration of `service`.
    ///
    /// Returns `Ok(false)` when there was nothing to remove.
    ///
    /// # Errors
    /// The transport's close failure; the registration is removed regardless.
    pub fn invalidate(&self, service: &ServiceId) -> Result<bool, TransportError> {
        match self.clients.remove(service) {
            Some((_, registration)) => {
                tracing::debug!(%service, "invalidated HTTP client registration");
                registration.client.close().map(|()| true)
            }
            None => Ok(false),
        }
    }

    /// Closes and removes every registration.
    ///
    /// # Errors
    /// The first close failure; every transport is still closed.
    pub fn close(&self) -> Result<(), TransportError> {
        let services: Vec<ServiceId> = self.clients.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;

        for service in services {
            if let Some((_, registration)) = self.clients.remove(&service)
                && let Err(err) = registration.client.close()
            {
                tracing::warn!(%service, error = %err, "failed to close HTTP client");
                first_error.get_or_insert(err);
            }
        }

        tracing::debug!("closed all HTTP client registrations");
        first_error.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn contains(&self, service: &ServiceId) -> bool {
        self.clients.contains_key(service)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Explicit path option, else a path-like first identifier, else empty.
fn context_path(service: &ServiceId, options: &ClientOptions) -> String {
    if let Some(path) = &options.path {
        return path.clone();
    }
    service
        .primary()
        .filter(|id| id.starts_with('/'))
        .map(str::to_owned)
        .unwrap_or_default()
}
