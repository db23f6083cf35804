// ── Command gateway ──
//
// Tracks in-flight writes per logical setting. Every intent gets a fresh
// sequence number; a newer intent for the same setting supersedes the
// older one outright (latest wins). An echo settles a command only if the
// reported value matches the *latest* target, and expiry only fires for
// the sequence it was scheduled against -- superseded sequences can never
// clear state they no longer own.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::sync::recover;

/// One in-flight command for one logical setting.
#[derive(Debug, Clone)]
pub struct PendingCommand<T> {
    pub sequence: u64,
    pub target: T,
    pub issued_at: Instant,
    pub timeout: Duration,
}

/// Sequence-numbered tracking of in-flight writes, keyed by logical
/// setting.
///
/// `K` is the feature's setting key (mode, altitude, ...); `T` is the
/// value an authoritative echo must match to settle the command.
pub struct CommandGateway<K, T> {
    next_sequence: AtomicU64,
    pending: Mutex<HashMap<K, PendingCommand<T>>>,
    timeout: Duration,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, T: Clone + PartialEq> CommandGateway<K, T> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_sequence: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured per-command timeout.
    pub fn command_timeout(&self) -> Duration {
        self.timeout
    }

    /// Record a new in-flight command for `key`, superseding any previous
    /// one. Returns the allocated sequence number.
    pub fn issue(&self, key: K, target: T) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let command = PendingCommand {
            sequence,
            target,
            issued_at: Instant::now(),
            timeout: self.timeout,
        };
        if let Some(superseded) = recover(self.pending.lock()).insert(key.clone(), command) {
            debug!(
                ?key,
                superseded = superseded.sequence,
                sequence,
                "intent superseded by newer command"
            );
        }
        sequence
    }

    /// The latest outstanding target for `key`, if any.
    pub fn pending_target(&self, key: &K) -> Option<T> {
        recover(self.pending.lock())
            .get(key)
            .map(|p| p.target.clone())
    }

    /// Settle the command for `key` if `reported` matches its target.
    /// Returns the settled sequence number, or `None` if nothing matched
    /// (including echoes for superseded targets).
    pub fn settle_matching(&self, key: &K, reported: &T) -> Option<u64> {
        let mut pending = recover(self.pending.lock());
        match pending.get(key) {
            Some(command) if command.target == *reported => {
                let sequence = command.sequence;
                pending.remove(key);
                Some(sequence)
            }
            _ => None,
        }
    }

    /// Expire the command for `key`, but only if `sequence` is still the
    /// latest outstanding one. Returns whether anything was cleared.
    pub fn expire(&self, key: &K, sequence: u64) -> bool {
        let mut pending = recover(self.pending.lock());
        match pending.get(key) {
            Some(command) if command.sequence == sequence => {
                debug!(
                    ?key,
                    sequence,
                    in_flight = ?command.issued_at.elapsed(),
                    "clearing expired command"
                );
                pending.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Drop every outstanding command (device lost). Returns how many
    /// were cleared.
    pub fn clear_all(&self) -> usize {
        let mut pending = recover(self.pending.lock());
        let cleared = pending.len();
        pending.clear();
        cleared
    }

    /// Whether a command is outstanding for `key`.
    pub fn is_updating(&self, key: &K) -> bool {
        recover(self.pending.lock()).contains_key(key)
    }

    /// Whether any command is outstanding.
    pub fn any_updating(&self) -> bool {
        !recover(self.pending.lock()).is_empty()
    }
}

/// Run `on_expire` after `timeout` unless cancelled first.
///
/// The closure is responsible for its own liveness check -- reconcilers
/// pass a weak reference and bail out if the owner is gone.
pub(crate) fn schedule_expiry(
    timeout: Duration,
    cancel: CancellationToken,
    on_expire: impl FnOnce() + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(timeout) => on_expire(),
        }
    })
}
