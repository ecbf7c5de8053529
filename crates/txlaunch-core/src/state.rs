//! Worker slot state machine
//!
//! ```text
//!   Idle ──dispatch──▶ Assigned ──worker wakes──▶ Executing
//!    ▲                                               │
//!    └──────────────── returned to free list ◀───────┘
//!
//!   Idle ──teardown──▶ Stopped
//! ```

/// State of one worker slot
///
/// Stored as a plain `u32` inside process-shared slots, so the
/// discriminants are part of the shared layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    /// On the free list, waiting for work
    Idle = 0,

    /// Request handed over, worker not yet woken
    Assigned = 1,

    /// Worker is running the request
    Executing = 2,

    /// Told to exit during teardown
    Stopped = 3,
}

impl SlotState {
    /// Check whether the worker has work to pick up
    #[inline]
    pub const fn has_work(&self) -> bool {
        matches!(self, SlotState::Assigned)
    }

    /// Check whether a transition to `next` is legal
    #[inline]
    pub const fn can_become(&self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::Idle, SlotState::Assigned)
                | (SlotState::Assigned, SlotState::Executing)
                | (SlotState::Executing, SlotState::Idle)
                | (SlotState::Idle, SlotState::Stopped)
        )
    }
}

impl From<u32> for SlotState {
    fn from(v: u32) -> Self {
        match v {
            0 => SlotState::Idle,
            1 => SlotState::Assigned,
            2 => SlotState::Executing,
            _ => SlotState::Stopped,
        }
    }
}

impl From<SlotState> for u32 {
    fn from(state: SlotState) -> u32 {
        state as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_u32() {
        for s in [SlotState::Idle, SlotState::Assigned, SlotState::Executing, SlotState::Stopped] {
            assert_eq!(SlotState::from(u32::from(s)), s);
        }
        assert_eq!(SlotState::from(99), SlotState::Stopped);
    }

    #[test]
    fn test_transitions() {
        assert!(SlotState::Idle.can_become(SlotState::Assigned));
        assert!(SlotState::Executing.can_become(SlotState::Idle));
        assert!(SlotState::Idle.can_become(SlotState::Stopped));
        assert!(!SlotState::Executing.can_become(SlotState::Stopped));
        assert!(!SlotState::Assigned.can_become(SlotState::Idle));
    }
}
