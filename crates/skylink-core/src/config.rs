// ── Runtime configuration ──
//
// Tuning knobs for the reconciliation core. Built by the embedding
// application and handed in at construction -- core never reads files.

use std::time::Duration;

/// Configuration shared by all reconcilers.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// How long a command may stay in flight before its `updating` flag
    /// reverts and the snapshot falls back to the last authoritative value.
    pub command_timeout: Duration,
}

impl CoreConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
        }
    }
}
