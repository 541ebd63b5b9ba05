use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    /// `follow_up` holds the OR-ed `forced` flag of requests that arrived
    /// while the current run was in flight.
    Running { follow_up: Option<bool> },
}

/// Single-slot supervisor for network reloads: at most one run at a time,
/// later requests collapse into one follow-up.
#[derive(Debug)]
pub struct ReloadSlot {
    state: Mutex<SlotState>,
}

impl Default for ReloadSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
        }
    }

    /// Claims the slot, or records a follow-up and returns `None` if a run
    /// is already in flight.
    pub fn try_acquire(&self, forced: bool) -> Option<SlotGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            SlotState::Idle => {
                *state = SlotState::Running { follow_up: None };
                Some(SlotGuard {
                    slot: self,
                    released: false,
                })
            }
            SlotState::Running { follow_up } => {
                *state = SlotState::Running {
                    follow_up: Some(follow_up.unwrap_or(false) || forced),
                };
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            SlotState::Running { .. }
        )
    }

    fn release(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SlotState::Idle;
    }
}

/// Ownership of a running slot. Dropping it releases the slot and discards
/// any pending follow-up.
#[derive(Debug)]
pub struct SlotGuard<'a> {
    slot: &'a ReloadSlot,
    released: bool,
}

impl SlotGuard<'_> {
    /// Takes the pending follow-up, keeping the slot claimed for it. With no
    /// follow-up pending the slot is released in the same critical section,
    /// so a request racing with the end of a run is never lost.
    pub fn take_follow_up(&mut self) -> Option<bool> {
        let mut state = self
            .slot
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *state {
            SlotState::Running {
                follow_up: Some(forced),
            } => {
                *state = SlotState::Running { follow_up: None };
                Some(forced)
            }
            _ => {
                *state = SlotState::Idle;
                self.released = true;
                None
            }
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.slot.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_coalesced() {
        let slot = ReloadSlot::new();
        let guard = slot.try_acquire(false);
        assert!(guard.is_some());
        assert!(slot.try_acquire(false).is_none());
        assert!(slot.is_running());
        drop(guard);
        assert!(!slot.is_running());
    }

    #[test]
    fn follow_up_ors_forced_flags() {
        let slot = ReloadSlot::new();
        let mut guard = slot.try_acquire(false).unwrap();
        assert!(slot.try_acquire(false).is_none());
        assert!(slot.try_acquire(true).is_none());
        assert!(slot.try_acquire(false).is_none());

        assert_eq!(guard.take_follow_up(), Some(true));
        assert!(slot.is_running());
        assert_eq!(guard.take_follow_up(), None);
        assert!(!slot.is_running());
    }

    #[test]
    fn dropping_guard_discards_follow_up() {
        let slot = ReloadSlot::new();
        let guard = slot.try_acquire(false).unwrap();
        assert!(slot.try_acquire(true).is_none());
        drop(guard);

        let mut next = slot.try_acquire(false).unwrap();
        assert_eq!(next.take_follow_up(), None);
    }

    #[test]
    fn released_guard_does_not_clobber_a_new_run() {
        let slot = ReloadSlot::new();
        let mut first = slot.try_acquire(false).unwrap();
        assert_eq!(first.take_follow_up(), None);

        let _second = slot.try_acquire(false).unwrap();
        drop(first);
        assert!(slot.is_running());
    }
}
