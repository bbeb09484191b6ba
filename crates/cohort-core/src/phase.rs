//! Participant lifecycle documents.
//!
//! The phase record and the module assignment record are the two
//! per-participant documents the state machine and the reconciler own.
//! Both live in the attachment store and are recomputed against every
//! cycle; nothing here caches between sweeps.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NewUser,
    Trial,
    Enrolled,
    Completed,
    Discontinued,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::NewUser,
        Phase::Trial,
        Phase::Enrolled,
        Phase::Completed,
        Phase::Discontinued,
    ];

    /// Terminal phases are never exited.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Discontinued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::NewUser => "new_user",
            Phase::Trial => "trial",
            Phase::Enrolled => "enrolled",
            Phase::Completed => "completed",
            Phase::Discontinued => "discontinued",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-participant phase record: current phase plus the entry timestamp of
/// every phase reached so far, in epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub status: Phase,
    #[serde(default)]
    pub entered: BTreeMap<Phase, i64>,
}

impl PhaseRecord {
    /// Record for a participant seen for the first time.
    pub fn fresh(now_ms: i64) -> Self {
        let mut entered = BTreeMap::new();
        entered.insert(Phase::NewUser, now_ms);
        PhaseRecord {
            status: Phase::NewUser,
            entered,
        }
    }

    pub fn entered_ms(&self, phase: Phase) -> Option<i64> {
        self.entered.get(&phase).copied()
    }

    /// Milliseconds spent in `phase` as of `now_ms`, if it was ever entered.
    pub fn elapsed_in(&self, phase: Phase, now_ms: i64) -> Option<i64> {
        self.entered_ms(phase).map(|t| now_ms - t)
    }

    /// Move to a new phase, stamping its entry at observation time.
    pub fn advance(&mut self, to: Phase, now_ms: i64) {
        self.status = to;
        self.entered.insert(to, now_ms);
    }
}

/// One activated module row in the assignment record. Window bounds are
/// offsets from the phase entry, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleAssignment {
    pub name: String,
    pub phase: Phase,
    pub start_ms: i64,
    pub end_ms: i64,
    pub shift_hour: u8,
}

/// Assignment record document: the modules currently scheduled for a
/// participant. Membership, not schedules, is what the reconciler diffs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssignmentRecord {
    #[serde(default)]
    pub modules: Vec<ModuleAssignment>,
}

impl AssignmentRecord {
    pub fn contains(&self, name: &str, phase: Phase) -> bool {
        self.modules
            .iter()
            .any(|m| m.name == name && m.phase == phase)
    }

    pub fn remove(&mut self, name: &str, phase: Phase) {
        self.modules
            .retain(|m| !(m.name == name && m.phase == phase));
    }
}

/// Passive-data quality snapshot, written by the analytics pipeline and
/// consumed opaquely at the trial decision. Missing snapshot reads as zero
/// coverage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualitySnapshot {
    /// Fraction of trial days with adequate passive data, in [0, 1].
    #[serde(default)]
    pub coverage: f64,
    #[serde(default)]
    pub updated_ms: Option<i64>,
}
