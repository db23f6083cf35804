// ── Core error types ──
//
// The only error consumers ever receive from this crate is the synchronous
// validation result of `apply(intent)`. Everything device-side is
// observable solely through snapshots: a command that fails is a snapshot
// that never changes to the requested value within the timeout.

use thiserror::Error;

/// Synchronous rejection of a user intent. No device write was attempted
/// and no state changed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// The requested value falls outside the device-reported bounds.
    #[error("{setting} value {value} outside device range [{min}, {max}]")]
    OutOfRange {
        setting: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The setting exists but cannot be edited on this device -- the
    /// peripheral is unsupported, or the firmware reports a value this
    /// build cannot represent.
    #[error("{setting} is not editable on this device")]
    NotEditable { setting: &'static str },

    /// The intent carried a malformed parameter.
    #[error("{setting}: {reason}")]
    Invalid {
        setting: &'static str,
        reason: String,
    },

    /// No device is currently attached, so bounds cannot be validated.
    #[error("no device connected")]
    Disconnected,
}
