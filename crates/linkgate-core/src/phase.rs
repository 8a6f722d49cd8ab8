//! Per-invocation phase machine.
//!
//! ```text
//! Started -> Probing -> Classifying -> (Retrying -> Probing)* -> Deciding -> Shaping -> Returned
//! ```
//!
//! `Classifying` may also go straight to `Deciding`, and `Retrying` goes to
//! `Deciding` when the overall deadline leaves no room for another attempt.
//! Nothing re-enters `Probing` once `Deciding` is reached.

use std::fmt;

use serde::Serialize;

/// Phase of a single gate invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    /// Correlation context created.
    Started,
    /// Linkage checks in flight.
    Probing,
    /// Probe result being classified.
    Classifying,
    /// Waiting out the backoff delay before the next attempt.
    Retrying,
    /// Applying the policy to the terminal outcome.
    Deciding,
    /// Padding the response time.
    Shaping,
    /// Decision handed back to the caller.
    Returned,
}

impl GatePhase {
    /// Returns the log label of the phase.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Probing => "probing",
            Self::Classifying => "classifying",
            Self::Retrying => "retrying",
            Self::Deciding => "deciding",
            Self::Shaping => "shaping",
            Self::Returned => "returned",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Started, Self::Probing)
                | (Self::Probing, Self::Classifying)
                | (Self::Classifying, Self::Retrying | Self::Deciding)
                | (Self::Retrying, Self::Probing | Self::Deciding)
                | (Self::Deciding, Self::Shaping)
                | (Self::Shaping, Self::Returned)
        )
    }

    /// Whether the phase is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Returned)
    }
}

impl fmt::Display for GatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks a recorded phase trail against the machine.
///
/// Returns the index of the first illegal transition.
#[must_use]
pub fn first_illegal_transition(trail: &[GatePhase]) -> Option<usize> {
    trail
        .windows(2)
        .position(|pair| !pair[0].can_transition_to(pair[1]))
        .map(|pos| pos + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_attempt_trail_is_legal() {
        let trail = [
            GatePhase::Started,
            GatePhase::Probing,
            GatePhase::Classifying,
            GatePhase::Deciding,
            GatePhase::Shaping,
            GatePhase::Returned,
        ];
        assert_eq!(first_illegal_transition(&trail), None);
    }

    #[test]
    fn retry_loop_is_legal() {
        let trail = [
            GatePhase::Started,
            GatePhase::Probing,
            GatePhase::Classifying,
            GatePhase::Retrying,
            GatePhase::Probing,
            GatePhase::Classifying,
            GatePhase::Retrying,
            GatePhase::Deciding,
            GatePhase::Shaping,
            GatePhase::Returned,
        ];
        assert_eq!(first_illegal_transition(&trail), None);
    }

    #[test]
    fn no_return_to_probing_after_deciding() {
        assert!(!GatePhase::Deciding.can_transition_to(GatePhase::Probing));
        assert!(!GatePhase::Shaping.can_transition_to(GatePhase::Probing));
        let trail = [
            GatePhase::Started,
            GatePhase::Probing,
            GatePhase::Classifying,
            GatePhase::Deciding,
            GatePhase::Probing,
        ];
        assert_eq!(first_illegal_transition(&trail), Some(4));
    }

    #[test]
    fn returned_is_terminal() {
        assert!(GatePhase::Returned.is_terminal());
        for next in [
            GatePhase::Started,
            GatePhase::Probing,
            GatePhase::Deciding,
            GatePhase::Returned,
        ] {
            assert!(!GatePhase::Returned.can_transition_to(next));
        }
    }
}
