//! Distributed transaction state machine.

use serde::{Deserialize, Serialize};

/// The status of a distributed transaction in its lifecycle.
///
/// State transitions:
/// ```text
/// Initiated ──► Preparing ──┬──► Prepared ──► Committing ──► Committed
///                           ├──► Failed ───┐
///                           └──► TimedOut ─┴──► Aborting ──► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributedTransactionStatus {
    /// Record created, nothing sent to participants yet.
    #[default]
    Initiated,

    /// Prepare requests are outstanding.
    Preparing,

    /// Every participant voted to commit.
    Prepared,

    /// Commit decision taken, commit notices being sent.
    Committing,

    /// Transaction committed (terminal state).
    Committed,

    /// A participant voted to abort or failed to prepare.
    Failed,

    /// The prepare phase did not finish within the bounded wait.
    TimedOut,

    /// Abort decision taken, abort notices being sent.
    Aborting,

    /// Transaction aborted (terminal state).
    Aborted,
}

impl DistributedTransactionStatus {
    /// Returns true if the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: DistributedTransactionStatus) -> bool {
        use DistributedTransactionStatus::*;
        matches!(
            (self, next),
            (Initiated, Preparing)
                | (Preparing, Prepared)
                | (Preparing, Failed)
                | (Preparing, TimedOut)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Failed, Aborting)
                | (TimedOut, Aborting)
                | (Aborting, Aborted)
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DistributedTransactionStatus::Committed | DistributedTransactionStatus::Aborted
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributedTransactionStatus::Initiated => "INITIATED",
            DistributedTransactionStatus::Preparing => "PREPARING",
            DistributedTransactionStatus::Prepared => "PREPARED",
            DistributedTransactionStatus::Committing => "COMMITTING",
            DistributedTransactionStatus::Committed => "COMMITTED",
            DistributedTransactionStatus::Failed => "FAILED",
            DistributedTransactionStatus::TimedOut => "TIMED_OUT",
            DistributedTransactionStatus::Aborting => "ABORTING",
            DistributedTransactionStatus::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for DistributedTransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::DistributedTransactionStatus::*;
    use super::*;

    const ALL: [DistributedTransactionStatus; 9] = [
        Initiated, Preparing, Prepared, Committing, Committed, Failed, TimedOut, Aborting, Aborted,
    ];

    #[test]
    fn test_default_is_initiated() {
        assert_eq!(DistributedTransactionStatus::default(), Initiated);
    }

    #[test]
    fn test_commit_path_is_allowed() {
        let path = [Initiated, Preparing, Prepared, Committing, Committed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_abort_paths_are_allowed() {
        for negative in [Failed, TimedOut] {
            let path = [Initiated, Preparing, negative, Aborting, Aborted];
            for pair in path.windows(2) {
                assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
            }
        }
    }

    #[test]
    fn test_each_state_has_the_expected_successors() {
        let successors = |from: DistributedTransactionStatus| -> Vec<DistributedTransactionStatus> {
            ALL.iter()
                .copied()
                .filter(|to| from.can_transition_to(*to))
                .collect()
        };

        assert_eq!(successors(Initiated), vec![Preparing]);
        assert_eq!(successors(Preparing), vec![Prepared, Failed, TimedOut]);
        assert_eq!(successors(Prepared), vec![Committing]);
        assert_eq!(successors(Committing), vec![Committed]);
        assert_eq!(successors(Failed), vec![Aborting]);
        assert_eq!(successors(TimedOut), vec![Aborting]);
        assert_eq!(successors(Aborting), vec![Aborted]);
        assert!(successors(Committed).is_empty());
        assert!(successors(Aborted).is_empty());
    }

    #[test]
    fn test_terminal_states() {
        for state in ALL {
            assert_eq!(state.is_terminal(), matches!(state, Committed | Aborted));
        }
    }

    #[test]
    fn test_display_matches_serialization() {
        for state in ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }
}
