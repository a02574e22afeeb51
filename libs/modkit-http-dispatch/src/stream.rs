//! Caller-side stream shapes and the single-value future bridge.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::call::StreamType;
use crate::error::DispatchError;
use crate::transport::{Reply, ReplyStream};

/// Adapts a transport stream to one caller-side stream type.
pub trait StreamConverter: Send + Sync {
    fn convert(&self, stream: ReplyStream) -> ReplyStream;
}

impl<F> StreamConverter for F
where
    F: Fn(ReplyStream) -> ReplyStream + Send + Sync,
{
    fn convert(&self, stream: ReplyStream) -> ReplyStream {
        self(stream)
    }
}

/// Converters keyed by [`StreamType`] name.
///
/// Comes with `stream` (identity), `single` (exactly one item) and `maybe`
/// (at most one item).
#[derive(Clone)]
pub struct StreamConverters {
    converters: HashMap<String, Arc<dyn StreamConverter>>,
}

impl Default for StreamConverters {
    fn default() -> Self {
        let mut converters = Self::empty();
        converters
            .register(StreamType::STREAM, Arc::new(|s: ReplyStream| s))
            .register(StreamType::SINGLE, Arc::new(single))
            .register(StreamType::MAYBE, Arc::new(|s: ReplyStream| s.take(1).boxed()));
        converters
    }
}

impl StreamConverters {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        stream_type: impl Into<String>,
        converter: Arc<dyn StreamConverter>,
    ) -> &mut Self {
        self.converters.insert(stream_type.into(), converter);
        self
    }

    #[must_use]
    pub fn supports(&self, stream_type: &StreamType) -> bool {
        self.converters.contains_key(stream_type.as_str())
    }

    /// # Errors
    /// [`DispatchError::UnsupportedStreamType`] when nothing is registered
    /// for `stream_type`.
    pub fn convert(
        &self,
        stream_type: &StreamType,
        stream: ReplyStream,
    ) -> Result<ReplyStream, DispatchError> {
        let converter = self.converters.get(stream_type.as_str()).ok_or_else(|| {
            DispatchError::UnsupportedStreamType {
                stream_type: stream_type.to_string(),
            }
        })?;
        Ok(converter.convert(stream))
    }
}

fn single(mut stream: ReplyStream) -> ReplyStream {
    stream::once(async move {
        match stream.next().await {
            Some(item) => item,
            None => Err(DispatchError::conversion(
                StreamType::SINGLE,
                "stream completed without an item",
            )),
        }
    })
    .boxed()
}

/// Result of a single-value call; `None` for no content or a soft 404.
pub type CallResult = Result<Option<Reply>, DispatchError>;

/// Future handed to callers of future-shaped operations.
///
/// Resolves with [`DispatchError::Interrupted`] if the task driving the call
/// goes away without completing it.
#[must_use = "futures do nothing unless awaited"]
pub struct CallFuture {
    rx: oneshot::Receiver<CallResult>,
}

impl Future for CallFuture {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(DispatchError::Interrupted)))
    }
}

/// Single-assignment holder backing a [`CallFuture`].
///
/// `offer` keeps the first value only; `complete` delivers exactly one
/// terminal result, later calls are ignored.
pub(crate) struct Completion {
    value: OnceLock<Reply>,
    sender: Mutex<Option<oneshot::Sender<CallResult>>>,
}

impl Completion {
    pub(crate) fn new() -> (Arc<Self>, CallFuture) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            value: OnceLock::new(),
            sender: Mutex::new(Some(tx)),
        });
        (completion, CallFuture { rx })
    }

    pub(crate) fn offer(&self, reply: Reply) -> bool {
        self.value.set(reply).is_ok()
    }

    pub(crate) fn buffered(&self) -> Option<Reply> {
        self.value.get().cloned()
    }

    pub(crate) fn complete(&self, result: CallResult) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                if tx.send(result).is_err() {
                    tracing::trace!("call future dropped before completion");
                }
                true
            }
            None => false,
        }
    }

    /// `true` once the caller dropped its [`CallFuture`].
    pub(crate) fn is_abandoned(&self) -> bool {
        self.sender.lock().as_ref().is_none_or(oneshot::Sender::is_closed)
    }
}
