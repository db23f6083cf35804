// ── Reactive snapshot streams ──
//
// Subscription types for consuming snapshot changes from a `StateStore`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// A subscription to one feature's snapshot.
///
/// Provides both point-in-time snapshot access and reactive change
/// notification via the `changed()` method or by converting to a `Stream`.
pub struct StateStream<S: Clone + Send + Sync + 'static> {
    current: S,
    receiver: watch::Receiver<S>,
}

impl<S: Clone + Send + Sync + 'static> StateStream<S> {
    pub(crate) fn new(receiver: watch::Receiver<S>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// The snapshot captured at creation time.
    pub fn current(&self) -> &S {
        &self.current
    }

    /// The latest snapshot (may have changed since creation).
    pub fn latest(&self) -> S {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change, returning the new snapshot.
    /// Returns `None` if the owning store has been dropped.
    pub async fn changed(&mut self) -> Option<S> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = snap.clone();
        Some(snap)
    }

    /// Convert into a `Stream` for use with `StreamExt` combinators.
    pub fn into_stream(self) -> SnapshotWatchStream<S> {
        SnapshotWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter backed by a `watch::Receiver`.
///
/// Yields the current snapshot first, then a new one on each store
/// publication.
pub struct SnapshotWatchStream<S: Clone + Send + Sync + 'static> {
    inner: WatchStream<S>,
}

impl<S: Clone + Send + Sync + 'static> Stream for SnapshotWatchStream<S> {
    type Item = S;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        // WatchStream is Unpin when the inner type is Unpin, which any
        // snapshot type is.
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::store::StateStore;

    #[tokio::test]
    async fn changed_tracks_store_publications() {
        let store = StateStore::new(0u32);
        let mut stream = store.stream();
        assert_eq!(*stream.current(), 0);

        store.publish(5);
        assert_eq!(stream.changed().await, Some(5));
        assert_eq!(*stream.current(), 5);
    }

    #[tokio::test]
    async fn changed_returns_none_after_store_drop() {
        let store = StateStore::new(0u32);
        let mut stream = store.stream();
        drop(store);
        assert_eq!(stream.changed().await, None);
    }

    #[test]
    fn latest_sees_newer_value_than_current() {
        let store = StateStore::new(1u32);
        let stream = store.stream();
        store.publish(2);
        assert_eq!(*stream.current(), 1);
        assert_eq!(stream.latest(), 2);
    }

    #[tokio::test]
    async fn into_stream_yields_current_then_changes() {
        use futures_util::StreamExt;

        let store = StateStore::new(0u32);
        let mut stream = store.stream().into_stream();
        assert_eq!(stream.next().await, Some(0));

        store.publish(9);
        assert_eq!(stream.next().await, Some(9));
    }
}
