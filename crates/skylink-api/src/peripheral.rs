// ── Peripheral identifiers and raw push frames ──
//
// Everything in this module is *as the device reports it*: enum values are
// raw numeric codes, bounds are whatever the firmware claims. Frames carry
// no interpretation -- a firmware newer than this build may report codes we
// have no name for, and they must survive the trip to the decoding layer.

use serde::{Deserialize, Serialize};
use strum::Display;

/// A logical hardware capability reported by the connected device.
///
/// The set here is the device's, not the application's: a reconciler covers
/// a subset of these, and a given airframe may support fewer still.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PeripheralKind {
    Geofence,
    Cellular,
    ReturnHome,
    Gimbal,
    Camera,
}

/// A device-reported numeric setting together with its reported bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundedValue {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl BoundedValue {
    pub fn new(value: f64, min: f64, max: f64) -> Self {
        Self { value, min, max }
    }

    /// Whether `candidate` falls within the device-reported bounds.
    pub fn contains(&self, candidate: f64) -> bool {
        candidate >= self.min && candidate <= self.max
    }
}

/// Raw geofence peripheral state.
///
/// `mode_code` is the firmware's enum value (0 = altitude-only,
/// 1 = cylinder on current firmware -- but never assume the set is closed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceFrame {
    pub mode_code: u32,
    pub max_altitude: BoundedValue,
    pub max_distance: BoundedValue,
}

/// Raw cellular modem state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellularFrame {
    pub sim_inserted: bool,
    pub activated: bool,
    /// Raw availability code (off / sim error / available, firmware-defined).
    pub availability_code: u32,
    /// True when the APN configuration is manual rather than auto-selected.
    pub apn_manual: bool,
    pub apn_url: Option<String>,
}

/// Raw return-home peripheral state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnHomeFrame {
    pub target_code: u32,
    pub min_altitude: BoundedValue,
    pub ending_behavior_code: u32,
}

/// The payload of one peripheral push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushFrame {
    Geofence(GeofenceFrame),
    Cellular(CellularFrame),
    ReturnHome(ReturnHomeFrame),
}

impl PushFrame {
    pub fn peripheral(&self) -> PeripheralKind {
        match self {
            Self::Geofence(_) => PeripheralKind::Geofence,
            Self::Cellular(_) => PeripheralKind::Cellular,
            Self::ReturnHome(_) => PeripheralKind::ReturnHome,
        }
    }
}

/// One notification on a peripheral push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushUpdate {
    /// New authoritative peripheral state.
    Value(PushFrame),
    /// The device explicitly reports this peripheral as unsupported.
    ///
    /// Distinct from "no value yet" -- an unsupported peripheral will never
    /// report a value, and consumers should present it as permanently
    /// disabled.
    Unsupported,
    /// The peripheral is not present on this device at all.
    Absent,
}

/// A generation-tagged push event.
///
/// The generation identifies which device connection produced the event;
/// subscriptions bound to a different generation drop it unapplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeripheralEvent {
    pub peripheral: PeripheralKind,
    pub generation: u64,
    pub update: PushUpdate,
}
