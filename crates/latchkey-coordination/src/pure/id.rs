//! Identifier sequencing.
//!
//! Identifiers are `second * IDS_PER_SECOND + sequence`. When a second's sequence
//! space is used up the generator moves on to the next second instead of wrapping,
//! so values never repeat and never decrease, even if the wall clock steps back.

use crate::constants::IDS_PER_SECOND;

/// Position of the last identifier handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IdSlot {
    pub second: u64,
    pub sequence: u64,
}

impl IdSlot {
    #[inline]
    pub fn value(&self) -> u64 {
        self.second.saturating_mul(IDS_PER_SECOND).saturating_add(self.sequence)
    }
}

/// Slot following `last` given the current wall-clock second.
///
/// `last` is `None` before the first identifier.
#[inline]
pub fn next_slot(last: Option<IdSlot>, now_second: u64) -> IdSlot {
    match last {
        None => IdSlot {
            second: now_second,
            sequence: 0,
        },
        Some(last) if now_second > last.second => IdSlot {
            second: now_second,
            sequence: 0,
        },
        Some(last) if last.sequence + 1 < IDS_PER_SECOND => IdSlot {
            second: last.second,
            sequence: last.sequence + 1,
        },
        Some(last) => IdSlot {
            second: last.second.saturating_add(1),
            sequence: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_slot() {
        let slot = next_slot(None, 1_700_000_000);
        assert_eq!(slot.value(), 1_700_000_000 * IDS_PER_SECOND);
    }

    #[test]
    fn test_sequence_within_second() {
        let a = next_slot(None, 5);
        let b = next_slot(Some(a), 5);
        assert_eq!(b.value(), a.value() + 1);
    }

    #[test]
    fn test_borrows_next_second_when_exhausted() {
        let last = IdSlot {
            second: 5,
            sequence: IDS_PER_SECOND - 1,
        };
        let next = next_slot(Some(last), 5);
        assert_eq!(next, IdSlot { second: 6, sequence: 0 });
        assert!(next.value() > last.value());
        // Clock catching up to the borrowed second keeps counting.
        let after = next_slot(Some(next), 6);
        assert_eq!(after.value(), next.value() + 1);
    }

    #[test]
    fn test_clock_step_back_stays_monotonic() {
        let last = IdSlot { second: 10, sequence: 3 };
        let next = next_slot(Some(last), 8);
        assert!(next.value() > last.value());
    }
}
