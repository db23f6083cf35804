// ── In-memory simulated device ──
//
// `SimDevice` implements `DeviceLink` without any transport underneath:
// tests and integration scenarios script pushes directly and inspect the
// write journal. With auto-echo enabled it behaves like a well-behaved
// airframe -- every accepted write is folded into the stored peripheral
// state and re-emitted as an authoritative push.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use crate::error::LinkError;
use crate::link::{DeviceHandle, DeviceLink};
use crate::peripheral::{PeripheralEvent, PeripheralKind, PushFrame, PushUpdate};
use crate::write::SettingWrite;

const PUSH_CHANNEL_SIZE: usize = 64;

/// A scriptable in-memory device.
///
/// Cheaply cloneable; all clones share the same channels, state, and
/// write journal.
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<SimInner>,
}

struct SimInner {
    handle: DeviceHandle,
    /// Generation stamped onto every emitted event.
    generation: AtomicU64,
    auto_echo: AtomicBool,
    closed: AtomicBool,
    channels: Mutex<HashMap<PeripheralKind, broadcast::Sender<PeripheralEvent>>>,
    /// Last authoritative frame per peripheral, used to synthesize echoes.
    state: Mutex<SimState>,
    writes: Mutex<Vec<SettingWrite>>,
}

#[derive(Default)]
struct SimState {
    geofence: Option<crate::peripheral::GeofenceFrame>,
    cellular: Option<crate::peripheral::CellularFrame>,
    return_home: Option<crate::peripheral::ReturnHomeFrame>,
}

fn recover<'a, T>(guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}

impl SimDevice {
    pub fn new(uid: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SimInner {
                handle: DeviceHandle {
                    uid: uid.into(),
                    model: model.into(),
                },
                generation: AtomicU64::new(0),
                auto_echo: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                channels: Mutex::new(HashMap::new()),
                state: Mutex::new(SimState::default()),
                writes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.inner.handle.clone()
    }

    /// Set the generation stamped onto subsequently emitted events.
    pub fn set_generation(&self, generation: u64) {
        self.inner.generation.store(generation, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// When enabled, every accepted write is applied to the stored frame
    /// and re-emitted as an authoritative push.
    pub fn set_auto_echo(&self, enabled: bool) {
        self.inner.auto_echo.store(enabled, Ordering::SeqCst);
    }

    /// Mark the link dead: subsequent writes fail with `LinkClosed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    // ── Scripted pushes ──────────────────────────────────────────────

    /// Push an authoritative frame, updating the stored state.
    pub fn push_frame(&self, frame: PushFrame) {
        let peripheral = frame.peripheral();
        self.store_frame(&frame);
        self.emit(PeripheralEvent {
            peripheral,
            generation: self.generation(),
            update: PushUpdate::Value(frame),
        });
    }

    /// Push an explicit "unsupported" notification for a peripheral.
    pub fn push_unsupported(&self, peripheral: PeripheralKind) {
        self.emit(PeripheralEvent {
            peripheral,
            generation: self.generation(),
            update: PushUpdate::Unsupported,
        });
    }

    /// Push an "absent" notification for a peripheral.
    pub fn push_absent(&self, peripheral: PeripheralKind) {
        self.emit(PeripheralEvent {
            peripheral,
            generation: self.generation(),
            update: PushUpdate::Absent,
        });
    }

    /// Push an event with an explicit generation tag, bypassing the
    /// device's own. Lets tests exercise stale-generation filtering.
    pub fn push_with_generation(&self, generation: u64, frame: PushFrame) {
        let peripheral = frame.peripheral();
        self.emit(PeripheralEvent {
            peripheral,
            generation,
            update: PushUpdate::Value(frame),
        });
    }

    // ── Write journal ────────────────────────────────────────────────

    /// All writes accepted so far, in order.
    pub fn writes(&self) -> Vec<SettingWrite> {
        recover(self.inner.writes.lock()).clone()
    }

    /// Drain the write journal.
    pub fn take_writes(&self) -> Vec<SettingWrite> {
        std::mem::take(&mut *recover(self.inner.writes.lock()))
    }

    // ── Internals ────────────────────────────────────────────────────

    fn emit(&self, event: PeripheralEvent) {
        let mut channels = recover(self.inner.channels.lock());
        let sender = channels
            .entry(event.peripheral)
            .or_insert_with(|| broadcast::channel(PUSH_CHANNEL_SIZE).0);
        // No receivers is fine -- nobody is listening yet.
        let _ = sender.send(event);
    }

    fn store_frame(&self, frame: &PushFrame) {
        let mut state = recover(self.inner.state.lock());
        match frame {
            PushFrame::Geofence(f) => state.geofence = Some(f.clone()),
            PushFrame::Cellular(f) => state.cellular = Some(f.clone()),
            PushFrame::ReturnHome(f) => state.return_home = Some(f.clone()),
        }
    }

    /// Fold a write into the stored state and return the frame to echo.
    fn apply_write(&self, write: &SettingWrite) -> Option<PushFrame> {
        let mut state = recover(self.inner.state.lock());
        match write {
            SettingWrite::GeofenceMaxAltitude(v) => {
                let f = state.geofence.as_mut()?;
                f.max_altitude.value = v.clamp(f.max_altitude.min, f.max_altitude.max);
                Some(PushFrame::Geofence(f.clone()))
            }
            SettingWrite::GeofenceMaxDistance(v) => {
                let f = state.geofence.as_mut()?;
                f.max_distance.value = v.clamp(f.max_distance.min, f.max_distance.max);
                Some(PushFrame::Geofence(f.clone()))
            }
            SettingWrite::GeofenceMode(code) => {
                let f = state.geofence.as_mut()?;
                f.mode_code = *code;
                Some(PushFrame::Geofence(f.clone()))
            }
            SettingWrite::CellularActivation(on) => {
                let f = state.cellular.as_mut()?;
                f.activated = *on;
                Some(PushFrame::Cellular(f.clone()))
            }
            SettingWrite::CellularApnAuto => {
                let f = state.cellular.as_mut()?;
                f.apn_manual = false;
                f.apn_url = None;
                Some(PushFrame::Cellular(f.clone()))
            }
            SettingWrite::CellularApnManual { url, .. } => {
                let f = state.cellular.as_mut()?;
                f.apn_manual = true;
                f.apn_url = Some(url.clone());
                Some(PushFrame::Cellular(f.clone()))
            }
            SettingWrite::ReturnHomeTarget(code) => {
                let f = state.return_home.as_mut()?;
                f.target_code = *code;
                Some(PushFrame::ReturnHome(f.clone()))
            }
            SettingWrite::ReturnHomeMinAltitude(v) => {
                let f = state.return_home.as_mut()?;
                f.min_altitude.value = v.clamp(f.min_altitude.min, f.min_altitude.max);
                Some(PushFrame::ReturnHome(f.clone()))
            }
            SettingWrite::ReturnHomeEndingBehavior(code) => {
                let f = state.return_home.as_mut()?;
                f.ending_behavior_code = *code;
                Some(PushFrame::ReturnHome(f.clone()))
            }
        }
    }
}

impl DeviceLink for SimDevice {
    fn events(&self, peripheral: PeripheralKind) -> broadcast::Receiver<PeripheralEvent> {
        let mut channels = recover(self.inner.channels.lock());
        channels
            .entry(peripheral)
            .or_insert_with(|| broadcast::channel(PUSH_CHANNEL_SIZE).0)
            .subscribe()
    }

    fn write(&self, write: SettingWrite) -> Result<(), LinkError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(LinkError::LinkClosed);
        }

        debug!(?write, uid = %self.inner.handle.uid, "sim write accepted");
        recover(self.inner.writes.lock()).push(write.clone());

        if self.inner.auto_echo.load(Ordering::SeqCst) {
            if let Some(frame) = self.apply_write(&write) {
                let peripheral = frame.peripheral();
                self.emit(PeripheralEvent {
                    peripheral,
                    generation: self.generation(),
                    update: PushUpdate::Value(frame),
                });
            }
        }

        Ok(())
    }
}
