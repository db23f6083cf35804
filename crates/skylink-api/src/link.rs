// ── Device link contract ──
//
// The narrow surface a connected device exposes to the reconciliation
// core: a broadcast push channel per peripheral, and a fire-and-forget
// write entry point. One link object represents one connection; a
// reconnect yields a fresh link.

use tokio::sync::broadcast;

use crate::error::LinkError;
use crate::peripheral::{PeripheralEvent, PeripheralKind};
use crate::write::SettingWrite;

/// Identity of a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// SDK-assigned serial, stable across connections.
    pub uid: String,
    pub model: String,
}

/// The asynchronous contract a connected device fulfils.
///
/// Implementations must be non-blocking on both paths: `events` hands out
/// a receiver without touching the device, and `write` queues the request
/// and returns. Pushes for a given peripheral arrive in the order the
/// device sent them; no ordering holds across peripherals.
pub trait DeviceLink: Send + Sync + 'static {
    /// Subscribe to the push channel for one peripheral.
    ///
    /// Events are tagged with the generation of the connection that
    /// produced them.
    fn events(&self, peripheral: PeripheralKind) -> broadcast::Receiver<PeripheralEvent>;

    /// Queue a setting write. Acknowledgment, if any, arrives as a later
    /// push on the corresponding peripheral channel.
    fn write(&self, write: SettingWrite) -> Result<(), LinkError>;
}
