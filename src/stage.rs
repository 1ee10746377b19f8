//! Stage lifecycle state machine.
//!
//! ```text
//!            ┌──────────► Completed
//!            │
//! Pending ─► Running ───► Skipped
//!    ▲       ▲   │
//!    │       │   └──────► Failed ─────────► PermanentlyFailed
//!  (init)    │              │                      │
//!            │              ▼ retry                │ retry
//!            └──────── Retrying ◄──────────────────┘
//! ```
//!
//! The machine is pure: no I/O, no clocks. The run view asks it whether a
//! status reported by a poll is an acceptable successor of what it currently
//! shows. Polls are samples, so a reported status is accepted when it is
//! *reachable* along valid edges (`Pending → Completed` is fine, the poll just
//! missed `Running`). A failed stage reported as moving on again was retried
//! on the server, so observations out of `Failed` and `PermanentlyFailed` may
//! use the retry edges. Explicit steps need [`TransitionCause::Retry`].

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::error::ParseError;

/// Lifecycle status of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageStatus {
    Pending,
    Skipped,
    Running,
    Completed,
    Failed,
    Retrying,
    PermanentlyFailed,
}

/// Why a transition is being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// The backend reported the new status (poll result, snapshot).
    Observed,
    /// The operator issued a retry command for this stage.
    Retry,
}

/// A transition the machine refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stage transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: StageStatus,
    pub to: StageStatus,
}

const ALL: [StageStatus; 7] = [
    StageStatus::Pending,
    StageStatus::Skipped,
    StageStatus::Running,
    StageStatus::Completed,
    StageStatus::Failed,
    StageStatus::Retrying,
    StageStatus::PermanentlyFailed,
];

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Skipped => "Skipped",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Retrying => "Retrying",
            Self::PermanentlyFailed => "PermanentlyFailed",
        }
    }

    /// Short operator-facing label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Running => "running",
            Self::Completed => "done",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::PermanentlyFailed => "failed (final)",
        }
    }

    /// Completed, Skipped and PermanentlyFailed end the stage unless it is retried.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Skipped | Self::PermanentlyFailed
        )
    }

    /// States the retry command may start from.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failed | Self::PermanentlyFailed)
    }

    /// Direct successors. `Retry` additionally unlocks the backward retry edges.
    fn successors(self, cause: TransitionCause) -> &'static [StageStatus] {
        use StageStatus::{
            Completed, Failed, PermanentlyFailed, Pending, Retrying, Running, Skipped,
        };
        match (self, cause) {
            (Pending, _) => &[Running],
            (Running, _) => &[Completed, Failed, Skipped],
            (Failed, TransitionCause::Observed) => &[PermanentlyFailed],
            (Failed, TransitionCause::Retry) => &[PermanentlyFailed, Retrying],
            (PermanentlyFailed, TransitionCause::Retry) => &[Retrying],
            (Retrying, _) => &[Running],
            (Completed | Skipped | PermanentlyFailed, _) => &[],
        }
    }

    /// Is `to` a single valid step from `self`?
    pub fn can_step(self, to: StageStatus, cause: TransitionCause) -> bool {
        self.successors(cause).contains(&to)
    }

    /// Is `to` reachable from `self` along valid edges (zero or more steps)?
    pub fn can_reach(self, to: StageStatus, cause: TransitionCause) -> bool {
        if self == to {
            return true;
        }
        let mut seen = [false; ALL.len()];
        let mut stack = vec![self];
        while let Some(state) = stack.pop() {
            for &next in state.successors(cause) {
                if next == to {
                    return true;
                }
                let idx = next.index();
                if !seen[idx] {
                    seen[idx] = true;
                    stack.push(next);
                }
            }
        }
        false
    }

    fn index(self) -> usize {
        ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = ParseError;

    /// Case-insensitive; accepts `PermanentlyFailed`, `permanently_failed`
    /// and `permanently-failed`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        ALL.iter()
            .copied()
            .find(|status| status.as_str().to_ascii_lowercase() == key)
            .ok_or_else(|| ParseError::new("stage.status", format!("unknown status {s:?}")))
    }
}

/// Apply a single explicit transition.
pub fn step(
    from: StageStatus,
    to: StageStatus,
    cause: TransitionCause,
) -> Result<StageStatus, InvalidTransition> {
    if from == to || from.can_step(to, cause) {
        Ok(to)
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// Accept a status sampled from the backend.
///
/// Samples may skip intermediate states, so any status reachable from
/// `current` is accepted. A failed stage reported past `Retrying` was retried
/// on the server, by this client or anyone else, so the retry edges apply.
pub fn observe(
    current: StageStatus,
    reported: StageStatus,
) -> Result<StageStatus, InvalidTransition> {
    let cause = if current.is_retryable() {
        TransitionCause::Retry
    } else {
        TransitionCause::Observed
    };
    if current.can_reach(reported, cause) {
        Ok(reported)
    } else {
        Err(InvalidTransition {
            from: current,
            to: reported,
        })
    }
}
