use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use super::CacheError;

/// Number of errors buffered for each lagging [`ErrorSink::subscribe`] receiver.
const CHANNEL_CAPACITY: usize = 64;

type Handler = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Identifies a handler registered with [`ErrorSink::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The out-of-band channel for errors that happen after the caller already got its result.
///
/// Detached writes and background refreshes have nobody to return their errors to, so they end
/// up here. Errors can be observed by registering a callback with [`on`](Self::on), or by
/// receiving them through [`subscribe`](Self::subscribe). Emitting without any listeners only
/// logs the error.
///
/// Cloning the sink is cheap, all clones share the same listeners.
#[derive(Clone)]
pub struct ErrorSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    handlers: Mutex<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<CacheError>,
}

impl ErrorSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SinkInner {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                sender,
            }),
        }
    }

    /// Registers a callback that is invoked for every emitted error.
    pub fn on<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers().push((id, Arc::new(handler)));
        id
    }

    /// Removes a callback registered with [`on`](Self::on).
    ///
    /// Returns `false` if the callback was already removed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers();
        let len = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != len
    }

    /// Returns a receiver for all errors emitted from now on.
    ///
    /// A receiver that falls behind by more than a few dozen errors skips the oldest ones.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheError> {
        self.inner.sender.subscribe()
    }

    /// Hands an error to all listeners.
    pub fn emit(&self, error: CacheError) {
        tracing::error!(error = %error, "detached cache operation failed");
        metric!(counter("caches.errors") += 1, "kind" => error.kind());

        // Handlers run outside of the lock, so they may themselves call `on` or `off`.
        let handlers: Vec<_> = self
            .handlers()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(&error);
        }

        // Fails only if nobody is subscribed, which is fine.
        let _ = self.inner.sender.send(error);
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Handler)>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSink")
            .field("handlers", &self.handlers().len())
            .field("receivers", &self.inner.sender.receiver_count())
            .finish()
    }
}
