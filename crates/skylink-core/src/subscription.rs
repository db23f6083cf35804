// ── Peripheral subscriptions ──
//
// Binds one peripheral push channel to one device generation. Updates
// tagged with any other generation are dropped before delivery. The
// cancellation guarantee is synchronous: delivery happens while holding
// the same lock that `cancel()` takes to flip the liveness flag, so once
// `cancel()` returns, no callback runs -- even for an update that was
// already in flight on another task.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skylink_api::{DeviceLink, PeripheralKind, PushUpdate};

use crate::sync::recover;

/// Owner of one live peripheral subscription.
///
/// Dropping the handle cancels the subscription; reconcilers also cancel
/// explicitly during teardown so the guarantee holds before `detach`
/// returns.
pub struct SubscriptionHandle {
    peripheral: PeripheralKind,
    generation: u64,
    live: Arc<Mutex<bool>>,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub fn peripheral(&self) -> PeripheralKind {
        self.peripheral
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Synchronously stop delivery. After this returns, the callback will
    /// not run again.
    pub fn cancel(&self) {
        // Taking the delivery lock first means any in-flight delivery has
        // either completed or will observe the cleared flag.
        *recover(self.live.lock()) = false;
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        !*recover(self.live.lock())
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Subscribe `callback` to one peripheral's push channel for one
/// generation.
///
/// The callback runs on the subscription task and must not block: it
/// should enqueue a state transition (typically a `StateStore` mutation)
/// and return.
pub fn subscribe(
    link: &dyn DeviceLink,
    peripheral: PeripheralKind,
    generation: u64,
    callback: impl Fn(PushUpdate) + Send + Sync + 'static,
) -> SubscriptionHandle {
    let mut rx = link.events(peripheral);
    let live = Arc::new(Mutex::new(true));
    let cancel = CancellationToken::new();

    let task_live = Arc::clone(&live);
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                () = task_cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(event) => {
                        if event.generation != generation {
                            debug!(
                                %peripheral,
                                bound = generation,
                                tagged = event.generation,
                                "dropping stale-generation update"
                            );
                            continue;
                        }
                        let guard = recover(task_live.lock());
                        if !*guard {
                            break;
                        }
                        // Delivered under the liveness lock (see module docs).
                        callback(event.update);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%peripheral, skipped, "subscription lagged behind device pushes");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    SubscriptionHandle {
        peripheral,
        generation,
        live,
        cancel,
    }
}
