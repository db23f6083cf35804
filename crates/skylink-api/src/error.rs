// ── Link-layer error types ──
//
// Errors surfaced at the device SDK boundary. Writes are fire-and-forget,
// so the only failures visible here are local: the link object is dead or
// the device refused to accept the write at all. Command outcomes are never
// reported through this type -- they arrive as later pushes, or not at all.

use thiserror::Error;

/// Error type for the device link surface.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The link object no longer represents a live connection.
    #[error("device link closed")]
    LinkClosed,

    /// The device rejected the write before queueing it.
    #[error("write rejected by device: {reason}")]
    WriteRejected { reason: String },
}
