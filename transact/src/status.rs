//! The transaction state machine.

use std::fmt;

/// The lifecycle status of a transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Heuristic,
}

impl Status {
    /// Return `true` if this transaction may move directly from this status to `next`.
    pub fn can_transition(&self, next: Status) -> bool {
        use Status::*;

        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, RollingBack)
                | (Preparing, Prepared)
                | (Preparing, RollingBack)
                | (Prepared, Committing)
                | (Committing, Committed)
                | (Committing, Heuristic)
                | (RollingBack, RolledBack)
                | (RollingBack, Heuristic)
        )
    }

    /// Return `true` if a transaction with this status may still be rolled back,
    /// by its owner or by the timeout supervisor.
    pub fn is_abortable(&self) -> bool {
        matches!(self, Self::Active | Self::Preparing)
    }

    /// Return `true` if this status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Heuristic)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "ACTIVE",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Heuristic => "HEURISTIC",
        })
    }
}

/// The result of a completed transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Outcome {
    Committed,
    RolledBack,
    TimedOut,
    Heuristic,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::TimedOut => "timed out",
            Self::Heuristic => "heuristic",
        })
    }
}

/// A resource manager's answer to a prepare request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Vote {
    Commit,
    Rollback,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Commit => "VOTE_COMMIT",
            Self::Rollback => "VOTE_ROLLBACK",
        })
    }
}
