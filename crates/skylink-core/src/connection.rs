// ── Connection registry ──
//
// Tracks the current device handle and its connection lifecycle. Each
// connected device instance is assigned a monotonically increasing
// generation; subscriptions bind to a generation and drop callbacks tagged
// with a superseded one. Replacement order is strict: the previous device
// is invalidated before observers hear anything about the new one, so no
// generation-G-1 callback can be applied once a reconciler has started
// observing generation G.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tracing::{debug, info};

use skylink_api::{DeviceHandle, DeviceLink};

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { generation: u64 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// The currently connected device: its identity, its link object, and the
/// generation under which it was registered.
#[derive(Clone)]
pub struct ActiveDevice {
    pub handle: DeviceHandle,
    pub link: Arc<dyn DeviceLink>,
    pub generation: u64,
}

impl std::fmt::Debug for ActiveDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDevice")
            .field("handle", &self.handle)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Tracks the current device and hands out generations.
///
/// Cheaply cloneable; one registry per session. The embedding application
/// bridges its SDK's connect/disconnect callbacks onto
/// [`connecting`](Self::connecting) / [`device_connected`](Self::device_connected) /
/// [`device_disconnected`](Self::device_disconnected).
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    state: watch::Sender<ConnectionState>,
    current: ArcSwapOption<ActiveDevice>,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(RegistryInner {
                state,
                current: ArcSwapOption::const_empty(),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// The currently connected device, if any. Wait-free.
    pub fn current(&self) -> Option<Arc<ActiveDevice>> {
        self.inner.current.load_full()
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to connection state changes (replay-latest).
    pub fn observe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// A connection attempt has started. Invalidates any current device.
    pub fn connecting(&self) {
        self.invalidate();
        let _ = self.inner.state.send(ConnectionState::Connecting);
    }

    /// A device became current. Returns the generation assigned to it.
    ///
    /// Ordering is load-bearing: the previous device is invalidated and
    /// observers notified *before* `Connected { generation }` is published,
    /// so reconcilers only ever subscribe against a registered generation.
    pub fn device_connected(&self, handle: DeviceHandle, link: Arc<dyn DeviceLink>) -> u64 {
        self.invalidate();

        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let device = ActiveDevice {
            handle,
            link,
            generation,
        };
        info!(uid = %device.handle.uid, generation, "device connected");

        self.inner.current.store(Some(Arc::new(device)));
        let _ = self
            .inner
            .state
            .send(ConnectionState::Connected { generation });
        generation
    }

    /// The current device went away.
    pub fn device_disconnected(&self) {
        self.invalidate();
        let _ = self.inner.state.send(ConnectionState::Disconnected);
    }

    /// Drop the current device and notify observers it is gone.
    fn invalidate(&self) {
        if let Some(previous) = self.inner.current.swap(None) {
            debug!(
                uid = %previous.handle.uid,
                generation = previous.generation,
                "invalidating device generation"
            );
            let _ = self.inner.state.send(ConnectionState::Disconnected);
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use skylink_api::SimDevice;

    fn sim_link() -> (DeviceHandle, Arc<dyn DeviceLink>) {
        let sim = SimDevice::new("SIM-000001", "sim-quad");
        (sim.handle(), Arc::new(sim))
    }

    #[test]
    fn generations_are_monotonic() {
        let registry = ConnectionRegistry::new();
        let (handle, link) = sim_link();
        let g1 = registry.device_connected(handle.clone(), Arc::clone(&link));
        registry.device_disconnected();
        let g2 = registry.device_connected(handle, link);
        assert!(g2 > g1);
    }

    #[test]
    fn replacement_invalidates_before_connecting() {
        let registry = ConnectionRegistry::new();
        let (handle, link) = sim_link();
        registry.device_connected(handle.clone(), Arc::clone(&link));
        assert!(registry.current().is_some());

        // Replacing without an explicit disconnect still swaps out the old
        // device before the new generation is published.
        let g2 = registry.device_connected(handle, link);
        let current = registry.current().unwrap();
        assert_eq!(current.generation, g2);
        assert_eq!(registry.state(), ConnectionState::Connected { generation: g2 });
    }

    #[test]
    fn observe_replays_latest_state() {
        let registry = ConnectionRegistry::new();
        assert_eq!(*registry.observe().borrow(), ConnectionState::Disconnected);

        let (handle, link) = sim_link();
        let generation = registry.device_connected(handle, link);
        assert_eq!(
            *registry.observe().borrow(),
            ConnectionState::Connected { generation }
        );
    }

    #[test]
    fn disconnect_clears_current() {
        let registry = ConnectionRegistry::new();
        let (handle, link) = sim_link();
        registry.device_connected(handle, link);
        registry.device_disconnected();
        assert!(registry.current().is_none());
        assert_eq!(registry.state(), ConnectionState::Disconnected);
    }
}
