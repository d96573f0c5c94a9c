//! Action outcome taxonomy and the per-message combination policy.

use serde::Serialize;
use std::fmt;

/// Classification of one downstream action result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl OutcomeKind {
    // Transient outranks permanent: a retry may still let both actions succeed
    fn severity(self) -> u8 {
        match self {
            OutcomeKind::Success => 0,
            OutcomeKind::PermanentFailure => 1,
            OutcomeKind::TransientFailure => 2,
        }
    }

    /// Combine two outcomes: any transient wins, then any permanent
    pub fn combine(self, other: OutcomeKind) -> OutcomeKind {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn is_success(self) -> bool {
        self == OutcomeKind::Success
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeKind::Success => write!(f, "success"),
            OutcomeKind::TransientFailure => write!(f, "transient_failure"),
            OutcomeKind::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

/// Result of one downstream action, tagged with the action's name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcome {
    pub action: &'static str,
    pub kind: OutcomeKind,
    pub detail: String,
}

impl ActionOutcome {
    pub fn success(action: &'static str, detail: impl Into<String>) -> Self {
        Self {
            action,
            kind: OutcomeKind::Success,
            detail: detail.into(),
        }
    }

    pub fn transient(action: &'static str, detail: impl Into<String>) -> Self {
        Self {
            action,
            kind: OutcomeKind::TransientFailure,
            detail: detail.into(),
        }
    }

    pub fn permanent(action: &'static str, detail: impl Into<String>) -> Self {
        Self {
            action,
            kind: OutcomeKind::PermanentFailure,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.action, self.kind, self.detail)
    }
}

/// Combined result of every action run for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingResult {
    pub kind: OutcomeKind,
    pub outcomes: Vec<ActionOutcome>,
}

impl ProcessingResult {
    pub fn from_outcomes(outcomes: Vec<ActionOutcome>) -> Self {
        let kind = outcomes
            .iter()
            .map(|o| o.kind)
            .fold(OutcomeKind::Success, OutcomeKind::combine);
        Self { kind, outcomes }
    }

    pub fn is_success(&self) -> bool {
        self.kind.is_success()
    }

    /// Failure details joined with `; `, or the success details when nothing failed
    pub fn detail(&self) -> String {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter(|o| !o.kind.is_success())
            .map(|o| format!("{}: {}", o.action, o.detail))
            .collect();

        if failures.is_empty() {
            self.outcomes
                .iter()
                .map(|o| format!("{}: {}", o.action, o.detail))
                .collect::<Vec<_>>()
                .join("; ")
        } else {
            failures.join("; ")
        }
    }
}
