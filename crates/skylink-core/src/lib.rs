//! Reconciliation core between the device SDK (`skylink-api`) and UI
//! consumers.
//!
//! Every hardware capability on a connected airframe (geofence, cellular
//! modem, return-home settings, ...) pushes asynchronous state on its own
//! schedule while the device itself connects and disconnects unpredictably.
//! This crate owns the recurring machinery that keeps consumers consistent
//! despite that:
//!
//! - **[`ConnectionRegistry`]** — the current device handle and its
//!   lifecycle. Each connected device instance gets a monotonically
//!   increasing *generation*; callbacks tagged with a superseded generation
//!   are dropped everywhere downstream.
//!
//! - **[`SubscriptionHandle`]** ([`subscription`]) — one peripheral push
//!   channel bound to one generation, with synchronous cancellation: after
//!   `cancel()` returns, no further delivery happens, even for an update
//!   already in flight on another task.
//!
//! - **[`StateStore`]** — the latest immutable snapshot for one feature,
//!   published only on value inequality and observed with replay-latest
//!   semantics. [`StateStream`] is the subscription handle vended to
//!   consumers.
//!
//! - **[`CommandGateway`]** ([`command`]) — sequence-numbered tracking of
//!   in-flight writes: latest intent wins, stale echoes are discarded, and
//!   a command that never echoes expires back to the authoritative value.
//!
//! - **Reconcilers** ([`reconciler`]) — per-feature composition units
//!   (geofence, cellular, return-home) that own subscriptions, derive a
//!   snapshot, and expose a validated `apply(intent)` surface.

pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod reconciler;
pub mod store;
pub mod stream;
pub mod subscription;

mod sync;

pub use command::{CommandGateway, PendingCommand};
pub use config::CoreConfig;
pub use connection::{ActiveDevice, ConnectionRegistry, ConnectionState};
pub use error::ValidationError;
pub use reconciler::{PeripheralValue, Reconciler, SupportState, spawn_binding};
pub use store::StateStore;
pub use stream::StateStream;
pub use subscription::SubscriptionHandle;

pub use reconciler::cellular::{
    ApnSelection, CellularAvailability, CellularIntent, CellularReconciler, CellularSnapshot,
};
pub use reconciler::geofence::{
    GeofenceIntent, GeofenceMode, GeofenceReconciler, GeofenceSnapshot,
};
pub use reconciler::return_home::{
    ReturnHomeIntent, ReturnHomeReconciler, ReturnHomeSnapshot, RthEndingBehavior, RthTarget,
};
