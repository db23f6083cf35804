//! Device SDK boundary for the skylink workspace.
//!
//! This crate defines the narrow surface through which the reconciliation
//! core talks to a flying device:
//!
//! - **[`DeviceLink`]** — the asynchronous push/write contract. Peripheral
//!   state arrives as generation-tagged [`PeripheralEvent`]s on a broadcast
//!   channel; writes are fire-and-forget and acknowledged only by a later
//!   push.
//! - **Raw frames** ([`peripheral`]) — per-peripheral state as the device
//!   reports it: numeric enum codes and device-reported bounds, no
//!   interpretation. Decoding (and degradation of unknown codes) is the
//!   core's job.
//! - **[`SettingWrite`]** — the typed write surface, one variant per
//!   device-side setting field.
//! - **[`SimDevice`]** ([`sim`]) — an in-memory device used by tests and
//!   integration scenarios: scripted frame injection, a write journal, and
//!   optional automatic echo of writes.

pub mod error;
pub mod link;
pub mod peripheral;
pub mod sim;
pub mod write;

pub use error::LinkError;
pub use link::{DeviceHandle, DeviceLink};
pub use peripheral::{
    BoundedValue, CellularFrame, GeofenceFrame, PeripheralEvent, PeripheralKind, PushFrame,
    PushUpdate, ReturnHomeFrame,
};
pub use sim::SimDevice;
pub use write::SettingWrite;
