//! Pure queue computation functions.

/// Due time for a task scheduled `delay_ms` from `now_ms`.
///
/// # Tiger Style
///
/// - Uses saturating_add to prevent overflow
#[inline]
pub fn due_at_ms(now_ms: u64, delay_ms: u64) -> u64 {
    now_ms.saturating_add(delay_ms)
}

/// Whether a delayed entry scored `due_ms` may be promoted at `now_ms`.
#[inline]
pub fn is_due(due_ms: f64, now_ms: u64) -> bool {
    due_ms <= now_ms as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_time() {
        assert_eq!(due_at_ms(1_000, 500), 1_500);
        assert_eq!(due_at_ms(u64::MAX, 1), u64::MAX);
    }

    #[test]
    fn test_is_due() {
        assert!(is_due(1_000.0, 1_000));
        assert!(is_due(999.0, 1_000));
        assert!(!is_due(1_001.0, 1_000));
    }
}
