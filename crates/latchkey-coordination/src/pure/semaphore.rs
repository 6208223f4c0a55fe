//! Pure semaphore computation functions.

/// Highest acquisition time that counts as expired.
///
/// Slot-set members scored at or below this are swept before any rank check.
///
/// # Tiger Style
///
/// - Uses saturating_sub to prevent underflow
#[inline]
pub fn expiry_cutoff_ms(now_ms: u64, timeout_ms: u64) -> u64 {
    now_ms.saturating_sub(timeout_ms)
}

/// Whether a holder at `rank` (0-based) is inside a semaphore of size `limit`.
#[inline]
pub fn is_admitted(rank: u64, limit: u64) -> bool {
    rank < limit
}
