//! Pure lock computation functions.

use crate::constants::MIN_LOCK_ACQUIRE_TIMEOUT_MS;

/// Apply the acquisition timeout floor.
///
/// # Tiger Style
///
/// - Never returns less than [`MIN_LOCK_ACQUIRE_TIMEOUT_MS`]
#[inline]
pub fn effective_acquire_timeout_ms(requested_ms: u64) -> u64 {
    requested_ms.max(MIN_LOCK_ACQUIRE_TIMEOUT_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_applies() {
        assert_eq!(effective_acquire_timeout_ms(0), MIN_LOCK_ACQUIRE_TIMEOUT_MS);
        assert_eq!(effective_acquire_timeout_ms(3), MIN_LOCK_ACQUIRE_TIMEOUT_MS);
        assert_eq!(effective_acquire_timeout_ms(500), 500);
    }
}
