// ── Geofence reconciler ──
//
// The geofence peripheral restricts how high and how far the airframe may
// fly. The device reports a mode (altitude-only or cylinder), a bounded
// max altitude, and a bounded max distance; the reconciler folds those
// into one snapshot and routes altitude/distance/mode intents back.
//
// Write ordering is load-bearing and asymmetric:
//   - activation writes the altitude bound *before* flipping the mode, so
//     the fence never appears active with a stale ceiling;
//   - deactivation flips the mode *before* releasing the ceiling to the
//     device maximum, so an out-of-range bound is never presented while
//     the fence is still active.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use skylink_api::peripheral::{GeofenceFrame, PushFrame};
use skylink_api::{PeripheralKind, PushUpdate, SettingWrite};

use crate::command::{self, CommandGateway};
use crate::connection::ActiveDevice;
use crate::error::ValidationError;
use crate::reconciler::{Observed, Reconciler, SupportState, check_range};
use crate::store::StateStore;
use crate::stream::StateStream;
use crate::config::CoreConfig;
use crate::subscription::{self, SubscriptionHandle};
use crate::sync::recover;

/// Factory defaults, used before any device has reported and by
/// [`GeofenceReconciler::reset_to_defaults`].
mod preset {
    pub const DEFAULT_ALTITUDE: f64 = 100.0;
    pub const DEFAULT_DISTANCE: f64 = 300.0;
    pub const MIN_ALTITUDE: f64 = 10.0;
    pub const MAX_ALTITUDE: f64 = 150.0;
    pub const MIN_DISTANCE: f64 = 100.0;
    pub const MAX_DISTANCE: f64 = 4000.0;
}

/// Geofence operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum GeofenceMode {
    /// Only the altitude bound is enforced (fence off).
    Altitude,
    /// Altitude and distance bounds are both enforced.
    Cylinder,
    /// Firmware reported a mode this build has no name for. The setting
    /// stays visible but is not editable.
    NotRepresentable(u32),
}

impl GeofenceMode {
    pub(crate) fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Altitude,
            1 => Self::Cylinder,
            other => Self::NotRepresentable(other),
        }
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            Self::Altitude => 0,
            Self::Cylinder => 1,
            Self::NotRepresentable(code) => code,
        }
    }

    /// Whether the fence is enforcing the distance bound.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Cylinder)
    }

    pub fn is_representable(self) -> bool {
        !matches!(self, Self::NotRepresentable(_))
    }
}

/// Immutable geofence state as presented to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceSnapshot {
    pub support: SupportState,
    pub mode: GeofenceMode,
    pub altitude: f64,
    pub distance: f64,
    pub min_altitude: f64,
    pub max_altitude: f64,
    pub min_distance: f64,
    pub max_distance: f64,
    /// A command is in flight; consumers present the setting as busy.
    pub updating: bool,
}

impl GeofenceSnapshot {
    /// The snapshot seeded before any device has reported.
    pub fn preset() -> Self {
        Self {
            support: SupportState::Unknown,
            mode: GeofenceMode::Cylinder,
            altitude: preset::DEFAULT_ALTITUDE,
            distance: preset::DEFAULT_DISTANCE,
            min_altitude: preset::MIN_ALTITUDE,
            max_altitude: preset::MAX_ALTITUDE,
            min_distance: preset::MIN_DISTANCE,
            max_distance: preset::MAX_DISTANCE,
            updating: false,
        }
    }

    pub fn is_editable(&self) -> bool {
        self.support != SupportState::Unsupported && self.mode.is_representable()
    }
}

/// User intents against the geofence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GeofenceIntent {
    /// Enable the cylinder fence with explicit bounds.
    Activate { altitude: f64, distance: f64 },
    /// Fall back to altitude-only mode.
    Deactivate,
    SetAltitude(f64),
    SetDistance(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SettingKey {
    Mode,
    Altitude,
    Distance,
}

#[derive(Debug, Clone, PartialEq)]
enum Target {
    Mode(GeofenceMode),
    Metres(f64),
}

/// Per-feature composition unit for the geofence peripheral.
///
/// Cheaply cloneable; the store outlives individual connections and keeps
/// the last known snapshot across a disconnect.
#[derive(Clone)]
pub struct GeofenceReconciler {
    inner: Arc<Inner>,
}

struct Inner {
    store: StateStore<GeofenceSnapshot>,
    gateway: CommandGateway<SettingKey, Target>,
    observed: Mutex<Observed<GeofenceFrame>>,
    device: ArcSwapOption<ActiveDevice>,
    subs: Mutex<Vec<SubscriptionHandle>>,
    cancel: CancellationToken,
}

impl GeofenceReconciler {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: StateStore::new(GeofenceSnapshot::preset()),
                gateway: CommandGateway::new(config.command_timeout),
                observed: Mutex::new(Observed::default()),
                device: ArcSwapOption::const_empty(),
                subs: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── State observation ────────────────────────────────────────────

    pub fn snapshot(&self) -> GeofenceSnapshot {
        self.inner.store.get()
    }

    pub fn observe(&self) -> tokio::sync::watch::Receiver<GeofenceSnapshot> {
        self.inner.store.observe()
    }

    pub fn stream(&self) -> StateStream<GeofenceSnapshot> {
        self.inner.store.stream()
    }

    // ── Intents ──────────────────────────────────────────────────────

    /// Validate and issue an intent. Rejection is synchronous and leaves
    /// no trace; acceptance publishes an optimistic snapshot and resolves
    /// through a later echo or expiry.
    pub fn apply(&self, intent: GeofenceIntent) -> Result<(), ValidationError> {
        let inner = &self.inner;
        let Some(device) = inner.device.load_full() else {
            return Err(ValidationError::Disconnected);
        };
        let snap = inner.store.get();
        if !snap.is_editable() {
            return Err(ValidationError::NotEditable {
                setting: "geofence",
            });
        }

        match intent {
            GeofenceIntent::Activate { altitude, distance } => {
                check_range("geofence altitude", altitude, snap.min_altitude, snap.max_altitude)?;
                check_range("geofence distance", distance, snap.min_distance, snap.max_distance)?;

                let alt_seq = inner.gateway.issue(SettingKey::Altitude, Target::Metres(altitude));
                let dist_seq = inner.gateway.issue(SettingKey::Distance, Target::Metres(distance));
                let mode_seq = inner
                    .gateway
                    .issue(SettingKey::Mode, Target::Mode(GeofenceMode::Cylinder));

                // Altitude bound first, mode flip last.
                inner.write(&device, SettingWrite::GeofenceMaxAltitude(altitude));
                inner.write(&device, SettingWrite::GeofenceMaxDistance(distance));
                inner.write(&device, SettingWrite::GeofenceMode(GeofenceMode::Cylinder.code()));

                self.schedule_expiry(SettingKey::Altitude, alt_seq);
                self.schedule_expiry(SettingKey::Distance, dist_seq);
                self.schedule_expiry(SettingKey::Mode, mode_seq);
            }
            GeofenceIntent::Deactivate => {
                let mode_seq = inner
                    .gateway
                    .issue(SettingKey::Mode, Target::Mode(GeofenceMode::Altitude));
                let alt_seq = inner
                    .gateway
                    .issue(SettingKey::Altitude, Target::Metres(snap.max_altitude));

                // Mode flip first, ceiling release last.
                inner.write(&device, SettingWrite::GeofenceMode(GeofenceMode::Altitude.code()));
                inner.write(&device, SettingWrite::GeofenceMaxAltitude(snap.max_altitude));

                self.schedule_expiry(SettingKey::Mode, mode_seq);
                self.schedule_expiry(SettingKey::Altitude, alt_seq);
            }
            GeofenceIntent::SetAltitude(altitude) => {
                check_range("geofence altitude", altitude, snap.min_altitude, snap.max_altitude)?;
                let seq = inner.gateway.issue(SettingKey::Altitude, Target::Metres(altitude));
                inner.write(&device, SettingWrite::GeofenceMaxAltitude(altitude));
                self.schedule_expiry(SettingKey::Altitude, seq);
            }
            GeofenceIntent::SetDistance(distance) => {
                check_range("geofence distance", distance, snap.min_distance, snap.max_distance)?;
                let seq = inner.gateway.issue(SettingKey::Distance, Target::Metres(distance));
                inner.write(&device, SettingWrite::GeofenceMaxDistance(distance));
                self.schedule_expiry(SettingKey::Distance, seq);
            }
        }

        inner.republish();
        Ok(())
    }

    /// Re-issue the factory defaults through the normal command path.
    pub fn reset_to_defaults(&self) -> Result<(), ValidationError> {
        self.apply(GeofenceIntent::Activate {
            altitude: preset::DEFAULT_ALTITUDE,
            distance: preset::DEFAULT_DISTANCE,
        })
    }

    fn schedule_expiry(&self, key: SettingKey, sequence: u64) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.gateway.command_timeout();
        command::schedule_expiry(timeout, self.inner.cancel.child_token(), move || {
            let Some(inner) = weak.upgrade() else { return };
            if inner.gateway.expire(&key, sequence) {
                warn!(?key, sequence, "geofence command expired without device echo");
                inner.republish();
            }
        });
    }
}

impl Inner {
    /// Derive the published snapshot: authoritative state with in-flight
    /// targets overlaid. Echo settlement, expiry, and disconnect all
    /// revert by removing the overlay.
    fn derive(&self) -> GeofenceSnapshot {
        let observed = recover(self.observed.lock());
        let mut snap = match &observed.peripheral.value {
            Some(frame) => GeofenceSnapshot {
                support: observed.support,
                mode: GeofenceMode::from_code(frame.mode_code),
                altitude: frame.max_altitude.value,
                distance: frame.max_distance.value,
                min_altitude: frame.max_altitude.min,
                max_altitude: frame.max_altitude.max,
                min_distance: frame.max_distance.min,
                max_distance: frame.max_distance.max,
                updating: false,
            },
            None => {
                let mut snap = GeofenceSnapshot::preset();
                snap.support = observed.support;
                snap
            }
        };
        drop(observed);

        if let Some(Target::Mode(mode)) = self.gateway.pending_target(&SettingKey::Mode) {
            snap.mode = mode;
        }
        if let Some(Target::Metres(altitude)) = self.gateway.pending_target(&SettingKey::Altitude) {
            snap.altitude = altitude;
        }
        if let Some(Target::Metres(distance)) = self.gateway.pending_target(&SettingKey::Distance) {
            snap.distance = distance;
        }
        snap.updating = self.gateway.any_updating();
        snap
    }

    fn republish(&self) {
        self.store.publish(self.derive());
    }

    fn write(&self, device: &ActiveDevice, write: SettingWrite) {
        if let Err(error) = device.link.write(write.clone()) {
            warn!(%error, ?write, "geofence write failed; command will expire");
        }
    }

    /// Fold one push into the authoritative state.
    fn on_update(&self, generation: u64, update: PushUpdate) {
        match update {
            PushUpdate::Value(PushFrame::Geofence(frame)) => {
                let mode = GeofenceMode::from_code(frame.mode_code);
                if let Some(seq) = self
                    .gateway
                    .settle_matching(&SettingKey::Mode, &Target::Mode(mode))
                {
                    debug!(sequence = seq, "geofence mode echo settled");
                }
                if let Some(seq) = self.gateway.settle_matching(
                    &SettingKey::Altitude,
                    &Target::Metres(frame.max_altitude.value),
                ) {
                    debug!(sequence = seq, "geofence altitude echo settled");
                }
                if let Some(seq) = self.gateway.settle_matching(
                    &SettingKey::Distance,
                    &Target::Metres(frame.max_distance.value),
                ) {
                    debug!(sequence = seq, "geofence distance echo settled");
                }

                recover(self.observed.lock()).record_value(frame, generation);
                self.republish();
            }
            PushUpdate::Unsupported | PushUpdate::Absent => {
                recover(self.observed.lock()).record_unsupported();
                self.gateway.clear_all();
                self.republish();
            }
            PushUpdate::Value(other) => {
                warn!(peripheral = %other.peripheral(), "unexpected frame on geofence channel");
            }
        }
    }

    fn cancel_subscriptions(&self) {
        for handle in recover(self.subs.lock()).drain(..) {
            handle.cancel();
        }
    }
}

impl Reconciler for GeofenceReconciler {
    fn attach(&self, device: &Arc<ActiveDevice>) {
        let inner = &self.inner;
        if inner.device.load_full().map(|d| d.generation) == Some(device.generation) {
            return;
        }

        // Previous-generation subscriptions go away before the new ones
        // exist; commands against the old device can never settle.
        inner.cancel_subscriptions();
        inner.gateway.clear_all();
        inner.device.store(Some(Arc::clone(device)));

        let generation = device.generation;
        let weak = Arc::downgrade(inner);
        let handle = subscription::subscribe(
            device.link.as_ref(),
            PeripheralKind::Geofence,
            generation,
            move |update| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_update(generation, update);
                }
            },
        );
        recover(inner.subs.lock()).push(handle);
        inner.republish();
    }

    fn detach(&self) {
        let inner = &self.inner;
        inner.cancel_subscriptions();
        inner.device.store(None);
        if inner.gateway.clear_all() > 0 {
            debug!("dropped in-flight geofence commands on disconnect");
        }
        inner.republish();
    }

    fn shutdown(&self) {
        self.detach();
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mode_codes_round_trip_and_degrade() {
        assert_eq!(GeofenceMode::from_code(0), GeofenceMode::Altitude);
        assert_eq!(GeofenceMode::from_code(1), GeofenceMode::Cylinder);
        let unknown = GeofenceMode::from_code(7);
        assert_eq!(unknown, GeofenceMode::NotRepresentable(7));
        assert_eq!(unknown.code(), 7);
        assert!(!unknown.is_representable());
    }

    #[test]
    fn preset_snapshot_is_sane() {
        let snap = GeofenceSnapshot::preset();
        assert_eq!(snap.support, SupportState::Unknown);
        assert!(snap.altitude >= snap.min_altitude && snap.altitude <= snap.max_altitude);
        assert!(snap.distance >= snap.min_distance && snap.distance <= snap.max_distance);
        assert!(!snap.updating);
    }

    #[test]
    fn apply_without_device_is_rejected() {
        let reconciler = GeofenceReconciler::new(&CoreConfig::default());
        assert_eq!(
            reconciler.apply(GeofenceIntent::SetAltitude(50.0)),
            Err(ValidationError::Disconnected)
        );
    }
}
