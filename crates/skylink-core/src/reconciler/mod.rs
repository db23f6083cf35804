// ── Reconciler composition ──
//
// A reconciler is the per-feature unit gluing the primitives together: it
// owns the subscriptions for its peripherals, folds pushes into an
// authoritative observed state, overlays in-flight command targets, and
// publishes the derived snapshot through its store. Teardown is
// deterministic -- every owned subscription handle is cancelled before
// `detach`/`shutdown` return, and late completions are guarded no-ops
// through weak references.

pub mod cellular;
pub mod geofence;
pub mod return_home;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{ActiveDevice, ConnectionRegistry, ConnectionState};

/// Whether the connected device supports a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SupportState {
    /// No device has reported yet.
    #[default]
    Unknown,
    Supported,
    /// The device explicitly reported the peripheral as unsupported or
    /// absent; the corresponding settings are permanently non-editable.
    Unsupported,
}

/// The aggregated state of one peripheral push channel.
///
/// `value` stays `None` until the first authoritative callback; an
/// explicit "unsupported" report is carried by [`SupportState`], never by
/// `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralValue<T> {
    pub value: Option<T>,
    pub updating: bool,
    pub generation: u64,
}

impl<T> Default for PeripheralValue<T> {
    fn default() -> Self {
        Self {
            value: None,
            updating: false,
            generation: 0,
        }
    }
}

/// Observed state of one peripheral: the latest authoritative value plus
/// the support tag.
#[derive(Debug, Clone)]
pub(crate) struct Observed<T> {
    pub peripheral: PeripheralValue<T>,
    pub support: SupportState,
}

impl<T> Default for Observed<T> {
    fn default() -> Self {
        Self {
            peripheral: PeripheralValue::default(),
            support: SupportState::default(),
        }
    }
}

impl<T> Observed<T> {
    pub(crate) fn record_value(&mut self, value: T, generation: u64) {
        self.peripheral.value = Some(value);
        self.peripheral.generation = generation;
        self.support = SupportState::Supported;
    }

    pub(crate) fn record_unsupported(&mut self) {
        self.peripheral.value = None;
        self.support = SupportState::Unsupported;
    }
}

/// Validate a numeric intent against device-reported bounds.
pub(crate) fn check_range(
    setting: &'static str,
    value: f64,
    min: f64,
    max: f64,
) -> Result<(), crate::error::ValidationError> {
    if value < min || value > max {
        return Err(crate::error::ValidationError::OutOfRange {
            setting,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// The lifecycle surface shared by all feature reconcilers.
///
/// `attach` must tear down any previous-generation subscriptions before
/// creating new ones; `detach` must cancel every owned subscription and
/// revert in-flight commands before returning; `shutdown` is `detach`
/// plus permanent cancellation of background work.
pub trait Reconciler: Send + Sync {
    fn attach(&self, device: &Arc<ActiveDevice>);
    fn detach(&self);
    fn shutdown(&self);
}

/// Drive a reconciler from the connection registry: attach on every
/// `Connected` generation, detach on `Disconnected`, shut down when
/// `cancel` fires.
///
/// The current state is applied immediately, so binding after a device is
/// already connected attaches right away.
pub fn spawn_binding(
    reconciler: Arc<dyn Reconciler>,
    registry: &ConnectionRegistry,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = registry.observe();
    let registry = registry.clone();
    tokio::spawn(async move {
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ConnectionState::Connected { generation } => {
                    if let Some(device) = registry.current() {
                        debug!(generation, "binding reconciler to device");
                        reconciler.attach(&device);
                    }
                }
                ConnectionState::Disconnected => reconciler.detach(),
                ConnectionState::Connecting => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    reconciler.shutdown();
                    break;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        reconciler.shutdown();
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use skylink_api::SimDevice;

    #[derive(Default)]
    struct CountingReconciler {
        attached: AtomicUsize,
        detached: AtomicUsize,
        shutdown: AtomicUsize,
    }

    impl Reconciler for CountingReconciler {
        fn attach(&self, _device: &Arc<ActiveDevice>) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }
        fn detach(&self) {
            self.detached.fetch_add(1, Ordering::SeqCst);
        }
        fn shutdown(&self) {
            self.shutdown.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn binding_follows_connection_lifecycle() {
        let registry = ConnectionRegistry::new();
        let reconciler = Arc::new(CountingReconciler::default());
        let cancel = CancellationToken::new();
        let task = spawn_binding(Arc::clone(&reconciler) as Arc<dyn Reconciler>, &registry, cancel.clone());

        // Initial state is Disconnected -> one detach.
        settle().await;
        assert_eq!(reconciler.detached.load(Ordering::SeqCst), 1);

        let sim = SimDevice::new("SIM-000001", "sim-quad");
        registry.device_connected(sim.handle(), Arc::new(sim));
        settle().await;
        assert_eq!(reconciler.attached.load(Ordering::SeqCst), 1);

        registry.device_disconnected();
        settle().await;
        assert_eq!(reconciler.detached.load(Ordering::SeqCst), 2);

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(reconciler.shutdown.load(Ordering::SeqCst), 1);
    }
}
