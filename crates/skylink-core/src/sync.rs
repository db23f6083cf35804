// ── Poison-tolerant lock acquisition ──
//
// Every mutex in this crate guards plain data with short critical
// sections; a panic while holding one leaves the data self-consistent,
// so poisoning is recovered rather than propagated.

use std::sync::{MutexGuard, PoisonError};

pub(crate) fn recover<'a, T>(
    guard: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    guard.unwrap_or_else(PoisonError::into_inner)
}
