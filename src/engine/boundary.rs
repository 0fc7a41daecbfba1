//! Boundary lifecycle state machine
//!
//! One upcoming boundary at a time walks IDLE → ARMED → PREFEED_ISSUED →
//! SWITCH_SCHEDULED → LIVE. Transitions are unidirectional; the only way back
//! to IDLE is from LIVE once the segment has fully passed, and FAILED_TERMINAL
//! is absorbing. Prefeed issuance is one-shot per boundary id.

use std::collections::HashSet;

/// Lifecycle state of the upcoming boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BoundaryState {
    /// No boundary pending.
    #[default]
    Idle,
    /// Boundary scheduled with a target time; prefeed not yet issued.
    Armed,
    /// Preview producer loading / shadow decoding.
    PrefeedIssued,
    /// Swap scheduled on the clock at the absolute deadline.
    SwitchScheduled,
    /// Transition committed; the segment is on air.
    Live,
    /// Issuance failed. Scheduling halts; operator reset required.
    FailedTerminal,
}

impl BoundaryState {
    /// Validate a transition before taking it.
    pub fn can_transition_to(&self, target: &BoundaryState) -> bool {
        use BoundaryState::*;

        match (self, target) {
            // Forward path
            (Idle, Armed) => true,
            (Armed, PrefeedIssued) => true,
            (PrefeedIssued, SwitchScheduled) => true,
            (SwitchScheduled, Live) => true,

            // A boundary can go live straight from Armed or PrefeedIssued
            // when the deadline arrives before scheduling caught up: the
            // clock, not readiness, decides.
            (Armed, Live) => true,
            (PrefeedIssued, Live) => true,

            // The cycle restarts only after the segment has passed
            (Live, Idle) => true,
            (Live, Armed) => true,

            // Any state can fail terminally, and terminal is absorbing
            (FailedTerminal, FailedTerminal) => true,
            (_, FailedTerminal) => true,
            (FailedTerminal, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Teardown executes immediately only from these.
    pub fn is_stable(&self) -> bool {
        matches!(self, BoundaryState::Idle | BoundaryState::Live)
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BoundaryState::Armed | BoundaryState::PrefeedIssued | BoundaryState::SwitchScheduled
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BoundaryState::FailedTerminal)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            BoundaryState::Idle => "IDLE",
            BoundaryState::Armed => "ARMED",
            BoundaryState::PrefeedIssued => "PREFEED_ISSUED",
            BoundaryState::SwitchScheduled => "SWITCH_SCHEDULED",
            BoundaryState::Live => "LIVE",
            BoundaryState::FailedTerminal => "FAILED_TERMINAL",
        }
    }
}

impl std::fmt::Display for BoundaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// One-shot issuance guard keyed by boundary id. A boundary that was issued
/// once is never issued again, whatever state the machine is in.
#[derive(Debug, Default)]
pub struct IssuanceGuard {
    issued: HashSet<u64>,
}

impl IssuanceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once per boundary id.
    pub fn try_issue(&mut self, boundary_id: u64) -> bool {
        self.issued.insert(boundary_id)
    }

    pub fn was_issued(&self, boundary_id: u64) -> bool {
        self.issued.contains(&boundary_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BoundaryState::*;

    #[test]
    fn test_forward_path() {
        assert!(Idle.can_transition_to(&Armed));
        assert!(Armed.can_transition_to(&PrefeedIssued));
        assert!(PrefeedIssued.can_transition_to(&SwitchScheduled));
        assert!(SwitchScheduled.can_transition_to(&Live));
        assert!(Live.can_transition_to(&Idle));
        assert!(Live.can_transition_to(&Armed));
    }

    #[test]
    fn test_no_backwards_transitions() {
        assert!(!Live.can_transition_to(&SwitchScheduled));
        assert!(!SwitchScheduled.can_transition_to(&PrefeedIssued));
        assert!(!PrefeedIssued.can_transition_to(&Armed));
        assert!(!Armed.can_transition_to(&Idle));
    }

    #[test]
    fn test_terminal_is_absorbing() {
        for state in [Idle, Armed, PrefeedIssued, SwitchScheduled, Live] {
            assert!(state.can_transition_to(&FailedTerminal));
        }
        assert!(!FailedTerminal.can_transition_to(&Idle));
        assert!(!FailedTerminal.can_transition_to(&Live));
        assert!(FailedTerminal.can_transition_to(&FailedTerminal));
    }

    #[test]
    fn test_deadline_overrides_readiness() {
        // The clock may commit a boundary whose prefeed never finished
        assert!(Armed.can_transition_to(&Live));
        assert!(PrefeedIssued.can_transition_to(&Live));
    }

    #[test]
    fn test_stability_classes() {
        assert!(Idle.is_stable());
        assert!(Live.is_stable());
        for state in [Armed, PrefeedIssued, SwitchScheduled] {
            assert!(state.is_transient());
            assert!(!state.is_stable());
        }
        assert!(FailedTerminal.is_terminal());
        assert!(!FailedTerminal.is_stable());
        assert!(!FailedTerminal.is_transient());
    }

    #[test]
    fn test_issuance_guard_one_shot() {
        let mut guard = IssuanceGuard::new();
        assert!(guard.try_issue(42));
        assert!(!guard.try_issue(42));
        assert!(guard.was_issued(42));
        assert!(guard.try_issue(43));
    }
}
