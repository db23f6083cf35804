// ── Snapshot state store ──
//
// One store holds the latest immutable snapshot for one feature. All
// mutation is whole-value replacement under the watch channel's writer
// lock; observers are notified only when the new value actually differs.
// Stores outlive connections -- they keep the last known snapshot across a
// disconnect and start from a caller-supplied default before any device
// has reported.

use tokio::sync::watch;

use crate::stream::StateStream;

/// Equality-deduplicated, single-writer/many-reader snapshot cell.
///
/// Readers never block writers and vice versa beyond the internal swap:
/// `get()` clones out of a read borrow, `publish()` replaces under the
/// single writer lock. Distinct stores never share a lock.
pub struct StateStore<S> {
    tx: watch::Sender<S>,
}

impl<S: Clone + PartialEq + Send + Sync + 'static> StateStore<S> {
    /// Create a store seeded with `default` -- the value observers see
    /// until the first publication.
    pub fn new(default: S) -> Self {
        let (tx, _) = watch::channel(default);
        Self { tx }
    }

    /// Non-blocking read of the latest snapshot.
    pub fn get(&self) -> S {
        self.tx.borrow().clone()
    }

    /// Replace the snapshot if it differs by value equality from the
    /// current one. Returns whether observers were notified.
    pub fn publish(&self, next: S) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    /// Copy-then-replace under the writer lock: `f` edits a draft and the
    /// result is published only if it differs from the previous value.
    /// No reader ever observes the intermediate draft.
    pub fn mutate(&self, f: impl FnOnce(&mut S)) -> bool {
        self.tx.send_if_modified(|current| {
            let previous = current.clone();
            f(current);
            *current != previous
        })
    }

    /// Subscribe to snapshot changes. The receiver immediately holds the
    /// current value, then yields only on actual change.
    pub fn observe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }

    /// Subscription handle with snapshot/`changed()`/`Stream` access.
    pub fn stream(&self) -> StateStream<S> {
        StateStream::new(self.tx.subscribe())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Snap {
        value: u32,
        updating: bool,
    }

    fn store() -> StateStore<Snap> {
        StateStore::new(Snap {
            value: 0,
            updating: false,
        })
    }

    #[test]
    fn get_returns_seeded_default() {
        assert_eq!(store().get().value, 0);
    }

    #[test]
    fn publish_notifies_on_change_only() {
        let store = store();
        let mut rx = store.observe();
        rx.mark_unchanged();

        assert!(store.publish(Snap {
            value: 1,
            updating: false
        }));
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        // Equal snapshot published twice -> exactly one notification.
        assert!(!store.publish(Snap {
            value: 1,
            updating: false
        }));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn mutate_is_whole_value_replacement() {
        let store = store();
        let changed = store.mutate(|s| {
            s.value = 7;
            s.updating = true;
        });
        assert!(changed);
        assert_eq!(
            store.get(),
            Snap {
                value: 7,
                updating: true
            }
        );
    }

    #[test]
    fn mutate_without_effect_does_not_notify() {
        let store = store();
        let mut rx = store.observe();
        rx.mark_unchanged();
        assert!(!store.mutate(|_| {}));
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn observers_see_replay_then_changes() {
        let store = store();
        store.publish(Snap {
            value: 3,
            updating: false,
        });

        // A late subscriber immediately sees the current value.
        let mut rx = store.observe();
        assert_eq!(rx.borrow_and_update().value, 3);

        store.publish(Snap {
            value: 4,
            updating: false,
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().value, 4);
    }
}
