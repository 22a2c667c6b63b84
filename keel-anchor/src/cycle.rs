//! The anchoring cycle state machine.
//!
//! ```text
//!            Start            Built                 Complete           Finalized
//!   Idle ──────────▶ Building ─────▶ AwaitingSignatures ─────▶ Finalizing ─────▶ Idle
//!    ▲                  │                    │                     │
//!    └──── Stall ───────┘                    │                     │
//!                       ▲      Restart       │                     │
//!                       └────────────────────┴─────────────────────┘
//!
//!   any state ── Halt ──▶ Halted ── Resume ──▶ Idle
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the local node is in the anchoring cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    /// Waiting for the next anchoring height.
    #[default]
    Idle,
    /// Building a proposal.
    Building,
    /// Proposal fixed; collecting signatures.
    AwaitingSignatures,
    /// Every input reached quorum; assembling the transaction.
    Finalizing,
    /// Stopped after a consistency error.
    Halted,
}

/// An event moving the cycle between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Anchoring height reached.
    Start,
    /// The proposal could not be built; retry at the next block.
    Stall,
    /// The proposal was built.
    Built,
    /// Every input reached quorum.
    Complete,
    /// The signed transaction was recorded.
    Finalized,
    /// A new epoch invalidated the in-flight proposal.
    Restart,
    /// Local state diverged from the network.
    Halt,
    /// An operator cleared the halt.
    Resume,
}

impl CycleState {
    /// The state after `transition`, or `None` if it is not allowed here.
    pub fn next(self, transition: Transition) -> Option<CycleState> {
        use CycleState::*;
        use Transition::*;

        match (self, transition) {
            (Idle, Start) => Some(Building),
            (Building, Stall) => Some(Idle),
            (Building, Built) => Some(AwaitingSignatures),
            (AwaitingSignatures, Complete) => Some(Finalizing),
            (Finalizing, Finalized) => Some(Idle),
            (Building | AwaitingSignatures | Finalizing, Restart) => Some(Building),
            (Halted, Halt) => None,
            (_, Halt) => Some(Halted),
            (Halted, Resume) => Some(Idle),
            _ => None,
        }
    }

    /// Whether a proposal is in flight.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            CycleState::Building | CycleState::AwaitingSignatures | CycleState::Finalizing
        )
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::Building => "building",
            CycleState::AwaitingSignatures => "awaiting_signatures",
            CycleState::Finalizing => "finalizing",
            CycleState::Halted => "halted",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CycleState::*;
    use Transition::*;

    #[test]
    fn test_happy_path() {
        let mut state = Idle;
        for t in [Start, Built, Complete, Finalized] {
            state = state.next(t).unwrap();
        }
        assert_eq!(state, Idle);
    }

    #[test]
    fn test_stall_returns_to_idle() {
        assert_eq!(Idle.next(Start).and_then(|s| s.next(Stall)), Some(Idle));
    }

    #[test]
    fn test_restart_from_active_states() {
        for state in [Building, AwaitingSignatures, Finalizing] {
            assert_eq!(state.next(Restart), Some(Building));
        }
        assert_eq!(Idle.next(Restart), None);
        assert_eq!(Halted.next(Restart), None);
    }

    #[test]
    fn test_halt_and_resume() {
        for state in [Idle, Building, AwaitingSignatures, Finalizing] {
            assert_eq!(state.next(Halt), Some(Halted));
        }
        assert_eq!(Halted.next(Start), None);
        assert_eq!(Halted.next(Resume), Some(Idle));
        assert_eq!(Idle.next(Resume), None);
    }

    #[test]
    fn test_invalid_transitions() {
        assert_eq!(Idle.next(Built), None);
        assert_eq!(AwaitingSignatures.next(Finalized), None);
        assert_eq!(Building.next(Complete), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(AwaitingSignatures.to_string(), "awaiting_signatures");
        assert!(Finalizing.is_active());
        assert!(!Idle.is_active());
    }
}
