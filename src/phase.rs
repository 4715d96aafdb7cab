use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a unit of work.
///
/// `BeforeCommit` and `AfterCommit` are only reached on the success path,
/// `OnRollback` and `AfterRollback` only on the failure path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    BeforeBegin,
    AfterBegin,
    BeforeCommit,
    AfterCommit,
    OnRollback,
    AfterRollback,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::BeforeBegin,
        Phase::AfterBegin,
        Phase::BeforeCommit,
        Phase::AfterCommit,
        Phase::OnRollback,
        Phase::AfterRollback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::BeforeBegin => "BEFORE_BEGIN",
            Phase::AfterBegin => "AFTER_BEGIN",
            Phase::BeforeCommit => "BEFORE_COMMIT",
            Phase::AfterCommit => "AFTER_COMMIT",
            Phase::OnRollback => "ON_ROLLBACK",
            Phase::AfterRollback => "AFTER_ROLLBACK",
        }
    }

    /// Phases that only occur once the body has succeeded.
    pub fn is_commit_path(&self) -> bool {
        matches!(self, Phase::BeforeCommit | Phase::AfterCommit)
    }

    /// Phases that only occur on failure.
    pub fn is_rollback_path(&self) -> bool {
        matches!(self, Phase::OnRollback | Phase::AfterRollback)
    }

    /// Whether this phase ends the lifecycle of a unit of work.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::AfterCommit | Phase::AfterRollback)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
