// ── Typed setting writes ──
//
// All device-side mutations flow through a single `SettingWrite` enum,
// one variant per writable setting field. Enum-valued settings are written
// as raw firmware codes; the reconciliation core encodes them.

use serde::{Deserialize, Serialize};

use crate::peripheral::PeripheralKind;

/// One fire-and-forget write to a device setting.
///
/// Writes carry no completion handle: the device acknowledges by pushing
/// updated peripheral state (or by never doing so).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingWrite {
    // ── Geofence ─────────────────────────────────────────────────────
    GeofenceMaxAltitude(f64),
    GeofenceMaxDistance(f64),
    GeofenceMode(u32),

    // ── Cellular ─────────────────────────────────────────────────────
    CellularActivation(bool),
    CellularApnAuto,
    CellularApnManual {
        url: String,
        username: String,
        password: String,
    },

    // ── Return home ──────────────────────────────────────────────────
    ReturnHomeTarget(u32),
    ReturnHomeMinAltitude(f64),
    ReturnHomeEndingBehavior(u32),
}

impl SettingWrite {
    /// The peripheral this write addresses.
    pub fn peripheral(&self) -> PeripheralKind {
        match self {
            Self::GeofenceMaxAltitude(_)
            | Self::GeofenceMaxDistance(_)
            | Self::GeofenceMode(_) => PeripheralKind::Geofence,
            Self::CellularActivation(_)
            | Self::CellularApnAuto
            | Self::CellularApnManual { .. } => PeripheralKind::Cellular,
            Self::ReturnHomeTarget(_)
            | Self::ReturnHomeMinAltitude(_)
            | Self::ReturnHomeEndingBehavior(_) => PeripheralKind::ReturnHome,
        }
    }
}
