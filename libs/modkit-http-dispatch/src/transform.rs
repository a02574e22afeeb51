use std::sync::Arc;

use futures::StreamExt;

use crate::call::Param;
use crate::fallback::ResolvedFallback;
use crate::transport::ReplyStream;

/// Lazily looks up the fallback of the operation being transformed.
pub type FallbackSupplier = Arc<dyn Fn() -> Option<ResolvedFallback> + Send + Sync>;

/// Post-processes the stream of a successful stream-shaped call.
pub trait ResultTransformer: Send + Sync {
    fn transform(
        &self,
        stream: ReplyStream,
        fallback: FallbackSupplier,
        params: Arc<[Param]>,
    ) -> ReplyStream;
}

/// Transformers applied in registration order.
#[derive(Clone, Default)]
pub struct ResultTransformerChain {
    transformers: Vec<Arc<dyn ResultTransformer>>,
}

impl ResultTransformerChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, transformer: Arc<dyn ResultTransformer>) -> &mut Self {
        self.transformers.push(transformer);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    #[must_use]
    pub fn apply(
        &self,
        stream: ReplyStream,
        fallback: &FallbackSupplier,
        params: &Arc<[Param]>,
    ) -> ReplyStream {
        self.transformers.iter().fold(stream, |stream, t| {
            t.transform(stream, Arc::clone(fallback), Arc::clone(params))
        })
    }
}

/// Replaces a failed item with the fallback's reply.
///
/// A 404 and non-transport errors pass through untouched, as does any error
/// for an operation with no fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamFallbackTransformer;

impl ResultTransformer for StreamFallbackTransformer {
    fn transform(
        &self,
        stream: ReplyStream,
        fallback: FallbackSupplier,
        params: Arc<[Param]>,
    ) -> ReplyStream {
        stream
            .then(move |item| {
                let fallback = Arc::clone(&fallback);
                let params = Arc::clone(&params);
                async move {
                    match item {
                        Err(err) if err.is_recoverable() && !err.is_not_found() => {
                            match fallback() {
                                Some(resolved) => {
                                    tracing::debug!(
                                        fallback = %resolved.registered_on(),
                                        error = %err,
                                        "resuming stream with fallback"
                                    );
                                    resolved.invoke(&params).await
                                }
                                None => Err(err),
                            }
                        }
                        other => other,
                    }
                }
            })
            .boxed()
    }
}
