use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one running attempt instance.
///
/// `Loading -> Active -> {Locked | Completed}`, with `FailedInit` as the abort
/// path out of `Loading`. `Locked`, `Completed` and `FailedInit` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AttemptPhase {
    Loading = 0,
    Active = 1,
    Locked = 2,
    Completed = 3,
    FailedInit = 4,
}

impl AttemptPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptPhase::Locked | AttemptPhase::Completed | AttemptPhase::FailedInit
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptPhase::Loading => "loading",
            AttemptPhase::Active => "active",
            AttemptPhase::Locked => "locked",
            AttemptPhase::Completed => "completed",
            AttemptPhase::FailedInit => "failed_init",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => AttemptPhase::Loading,
            1 => AttemptPhase::Active,
            2 => AttemptPhase::Locked,
            3 => AttemptPhase::Completed,
            _ => AttemptPhase::FailedInit,
        }
    }

    fn may_become(self, next: AttemptPhase) -> bool {
        matches!(
            (self, next),
            (AttemptPhase::Loading, AttemptPhase::Active)
                | (AttemptPhase::Loading, AttemptPhase::FailedInit)
                | (AttemptPhase::Active, AttemptPhase::Locked)
                | (AttemptPhase::Active, AttemptPhase::Completed)
        )
    }
}

/// Single atomic cell holding the phase. Every transition is a compare-and-set
/// from an expected phase, so concurrent callers racing for the same edge see
/// exactly one winner and nothing ever leaves a terminal phase.
#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(AttemptPhase::Loading as u8))
    }

    pub fn load(&self) -> AttemptPhase {
        AttemptPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns true if this call performed `from -> to`.
    pub fn transition(&self, from: AttemptPhase, to: AttemptPhase) -> bool {
        if !from.may_become(to) {
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
