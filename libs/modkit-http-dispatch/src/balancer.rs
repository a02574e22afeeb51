//! Endpoint selection for logical services.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use url::Url;

use crate::call::ServiceId;
use crate::config::{ConfigError, DispatchConfig};
use crate::error::TransportError;

/// One live endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub id: String,
    pub url: Url,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self { id: id.into(), url }
    }
}

/// Hands out an endpoint for each request.
pub trait LoadBalancer: Send + Sync {
    /// Picks the instance the next request goes to.
    ///
    /// # Errors
    /// [`TransportError::NoAvailableInstance`] when nothing is registered.
    fn select(&self) -> Result<ServiceInstance, TransportError>;
}

/// Always returns the same endpoint.
#[derive(Debug, Clone)]
pub struct FixedLoadBalancer {
    instance: ServiceInstance,
}

impl FixedLoadBalancer {
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            instance: ServiceInstance::new(url.to_string(), url),
        }
    }
}

impl LoadBalancer for FixedLoadBalancer {
    fn select(&self) -> Result<ServiceInstance, TransportError> {
        Ok(self.instance.clone())
    }
}

/// Current set of instances for a named service, e.g. backed by discovery.
pub trait ServiceInstanceList: Send + Sync {
    fn id(&self) -> &str;

    fn instances(&self) -> Vec<ServiceInstance>;
}

/// Instance list fixed at construction, usually from configuration.
#[derive(Debug, Clone)]
pub struct StaticServiceInstanceList {
    id: String,
    instances: Vec<ServiceInstance>,
}

impl StaticServiceInstanceList {
    pub fn new(id: impl Into<String>, urls: impl IntoIterator<Item = Url>) -> Self {
        let id = id.into();
        let instances = urls
            .into_iter()
            .enumerate()
            .map(|(i, url)| ServiceInstance::new(format!("{id}-{i}"), url))
            .collect();
        Self { id, instances }
    }
}

impl ServiceInstanceList for StaticServiceInstanceList {
    fn id(&self) -> &str {
        &self.id
    }

    fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.clone()
    }
}

/// Cycles through the instances of a [`ServiceInstanceList`].
pub struct RoundRobinLoadBalancer {
    list: Arc<dyn ServiceInstanceList>,
    counter: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    #[must_use]
    pub fn new(list: Arc<dyn ServiceInstanceList>) -> Self {
        Self {
            list,
            counter: AtomicUsize::new(0),
        }
    }
}

impl fmt::Debug for RoundRobinLoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoundRobinLoadBalancer")
            .field("service", &self.list.id())
            .finish_non_exhaustive()
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select(&self) -> Result<ServiceInstance, TransportError> {
        let mut instances = self.list.instances();
        if instances.is_empty() {
            return Err(TransportError::NoAvailableInstance {
                service: self.list.id().to_owned(),
            });
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % instances.len();
        Ok(instances.swap_remove(idx))
    }
}

/// Maps a logical service identifier to a load balancer.
pub trait LoadBalancerResolver: Send + Sync {
    /// `None` when the identifier names nothing this resolver knows about.
    fn resolve(&self, service: &ServiceId) -> Option<Arc<dyn LoadBalancer>>;
}

/// Resolves by the first identifier of a [`ServiceId`]:
///
/// - an absolute `http(s)` URL is used as-is;
/// - a path (`/...`) targets the local server, which must be configured;
/// - anything else is looked up among the registered instance lists.
#[derive(Default)]
pub struct DefaultLoadBalancerResolver {
    local_server: Option<Url>,
    lists: HashMap<String, Arc<dyn ServiceInstanceList>>,
}

impl DefaultLoadBalancerResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_local_server(mut self, url: Url) -> Self {
        self.local_server = Some(url);
        self
    }

    #[must_use]
    pub fn with_list(mut self, list: Arc<dyn ServiceInstanceList>) -> Self {
        self.lists.insert(list.id().to_owned(), list);
        self
    }

    /// Builds a resolver from the `local_server_url` and `services` sections.
    ///
    /// # Errors
    /// [`ConfigError::InvalidUrl`] for any URL that does not parse.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, ConfigError> {
        let mut resolver = Self::new();
        if let Some(url) = &config.local_server_url {
            resolver.local_server = Some(parse_url("local_server_url", url)?);
        }
        for (name, service) in &config.services {
            let urls = service
                .urls
                .iter()
                .map(|u| parse_url(name, u))
                .collect::<Result<Vec<_>, _>>()?;
            resolver = resolver.with_list(Arc::new(StaticServiceInstanceList::new(name, urls)));
        }
        Ok(resolver)
    }
}

fn parse_url(owner: &str, url: &str) -> Result<Url, ConfigError> {
    Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        owner: owner.to_owned(),
        url: url.to_owned(),
        reason: e.to_string(),
    })
}

impl LoadBalancerResolver for DefaultLoadBalancerResolver {
    fn resolve(&self, service: &ServiceId) -> Option<Arc<dyn LoadBalancer>> {
        let reference = service.primary()?;

        if reference.starts_with("http://") || reference.starts_with("https://") {
            let url = Url::parse(reference).ok()?;
            return Some(Arc::new(FixedLoadBalancer::new(url)));
        }

        if reference.starts_with('/') {
            let url = self.local_server.clone()?;
            return Some(Arc::new(FixedLoadBalancer::new(url)));
        }

        let list = self.lists.get(reference)?;
        Some(Arc::new(RoundRobinLoadBalancer::new(Arc::clone(list))))
    }
}
