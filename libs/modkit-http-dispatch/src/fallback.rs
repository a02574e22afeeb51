//! Fallback implementations for failed client operations.
//!
//! Fallbacks are registered under an [`OperationKey`]. Lookup tries the
//! declaring type of the failed operation first, then every interface it was
//! declared to implement, depth-first in declaration order.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::call::{OperationKey, Param};
use crate::error::DispatchError;
use crate::transport::Reply;

/// Alternate implementation of a client operation.
#[async_trait]
pub trait Fallback: Send + Sync {
    /// Runs with the same parameter values as the failed call.
    async fn invoke(&self, params: &[Param]) -> anyhow::Result<Reply>;
}

struct FnFallback<F>(F);

#[async_trait]
impl<F, Fut> Fallback for FnFallback<F>
where
    F: Fn(Vec<Param>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Reply>> + Send,
{
    async fn invoke(&self, params: &[Param]) -> anyhow::Result<Reply> {
        (self.0)(params.to_vec()).await
    }
}

/// Wraps an async closure as a [`Fallback`].
pub fn from_fn<F, Fut>(f: F) -> Arc<dyn Fallback>
where
    F: Fn(Vec<Param>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    Arc::new(FnFallback(f))
}

/// A fallback found for a specific failed operation.
#[derive(Clone)]
pub struct ResolvedFallback {
    declaring_type: String,
    registered_on: OperationKey,
    fallback: Arc<dyn Fallback>,
}

impl ResolvedFallback {
    /// Key the fallback was registered under.
    #[must_use]
    pub fn registered_on(&self) -> &OperationKey {
        &self.registered_on
    }

    /// # Errors
    /// [`DispatchError::FallbackInvocation`] wrapping the fallback's own error.
    pub async fn invoke(&self, params: &[Param]) -> Result<Reply, DispatchError> {
        self.fallback
            .invoke(params)
            .await
            .map_err(|e| DispatchError::FallbackInvocation {
                declaring_type: self.declaring_type.clone(),
                source: e.into(),
            })
    }
}

impl fmt::Debug for ResolvedFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedFallback")
            .field("declaring_type", &self.declaring_type)
            .field("registered_on", &self.registered_on)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct FallbackRegistry {
    fallbacks: HashMap<OperationKey, Arc<dyn Fallback>>,
    interfaces: HashMap<String, Vec<String>>,
}

impl FallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `fallback` for `operation`, replacing any previous one.
    pub fn register(&mut self, operation: OperationKey, fallback: Arc<dyn Fallback>) -> &mut Self {
        self.fallbacks.insert(operation, fallback);
        self
    }

    /// Declares the direct interfaces of `type_name`, in order.
    pub fn declare_interfaces<I, S>(&mut self, type_name: &str, interfaces: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interfaces
            .entry(type_name.to_owned())
            .or_default()
            .extend(interfaces.into_iter().map(Into::into));
        self
    }

    /// Every interface reachable from `type_name`: direct ones first, then
    /// each one's own interfaces recursively. Duplicates and cycles are skipped.
    #[must_use]
    pub fn interfaces_of(&self, type_name: &str) -> Vec<String> {
        let mut seen = vec![type_name.to_owned()];
        self.collect_interfaces(type_name, &mut seen);
        seen.split_off(1)
    }

    fn collect_interfaces(&self, type_name: &str, seen: &mut Vec<String>) {
        let Some(direct) = self.interfaces.get(type_name) else {
            return;
        };
        let fresh: Vec<&String> = direct.iter().filter(|i| !seen.contains(*i)).collect();
        seen.extend(fresh.iter().map(|i| (*i).clone()));
        for iface in fresh {
            self.collect_interfaces(iface, seen);
        }
    }

    /// First fallback matching `operation` on its declaring type or interfaces.
    #[must_use]
    pub fn find(&self, operation: &OperationKey) -> Option<ResolvedFallback> {
        let resolved = |key: OperationKey| {
            self.fallbacks.get(&key).map(|fallback| ResolvedFallback {
                declaring_type: operation.declaring_type.clone(),
                registered_on: key,
                fallback: Arc::clone(fallback),
            })
        };

        resolved(operation.clone()).or_else(|| {
            self.interfaces_of(&operation.declaring_type)
                .iter()
                .find_map(|iface| resolved(operation.on_type(iface)))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fallbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fallbacks.is_empty()
    }
}
