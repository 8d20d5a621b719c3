// ── Reactive variable streams ──
//
// Pull-style subscription handles over a `TrackingVariable`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// A subscription to one tracking variable.
///
/// Provides point-in-time snapshot access and change notification via
/// [`changed()`](Self::changed) or by converting to a `Stream`.
pub struct VariableStream<T: Clone + Send + Sync + 'static> {
    current: Option<T>,
    receiver: watch::Receiver<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> VariableStream<T> {
    pub(crate) fn new(receiver: watch::Receiver<Option<T>>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// The value captured at creation time or at the last `changed()`.
    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    /// The latest committed value.
    pub fn latest(&self) -> Option<T> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next commit. Returns `None` once the variable is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.receiver.changed().await.ok()?;
        let value = self.receiver.borrow_and_update().clone();
        self.current.clone_from(&value);
        value
    }

    /// Convert into a `Stream` of committed values. Yields the current value
    /// first, if there is one.
    pub fn into_stream(self) -> VariableWatchStream<T> {
        VariableWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`. Empty states are skipped.
pub struct VariableWatchStream<T: Clone + Send + Sync + 'static> {
    inner: WatchStream<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Stream for VariableWatchStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Some(value))) => return Poll::Ready(Some(value)),
                Poll::Ready(Some(None)) => {}
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
