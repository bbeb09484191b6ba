//! Static study catalog.
//!
//! One table drives both engines: module descriptors (which activities run
//! in which phase window) and incentive tier descriptors. Adding a module
//! or a tier means adding a row here; the reconciler and the incentive
//! evaluator dispatch over whatever the table contains.

use std::collections::BTreeSet;

use crate::clock::days_ms;
use crate::directory::Cadence;
use crate::error::{Result, ValidationError};
use crate::phase::Phase;

/// One activity inside a module. Offsets are added to the module's shift
/// hour to place each schedule entry.
#[derive(Debug, Clone, Copy)]
pub struct ActivitySpec {
    pub name: &'static str,
    pub cadence: Cadence,
    pub offsets_ms: &'static [i64],
}

/// One module: a named bundle of activities active during a day window of
/// a phase. Window bounds are days since phase entry, end exclusive.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSpec {
    pub name: &'static str,
    pub phase: Phase,
    pub start_day: i64,
    pub end_day: i64,
    pub shift_hour: u8,
    pub greeting: &'static str,
    pub activities: &'static [ActivitySpec],
}

impl ModuleSpec {
    /// Window bounds in milliseconds since phase entry.
    pub fn window_ms(&self) -> (i64, i64) {
        (days_ms(self.start_day), days_ms(self.end_day))
    }

    pub fn window_contains(&self, elapsed_ms: i64) -> bool {
        let (start, end) = self.window_ms();
        elapsed_ms >= start && elapsed_ms < end
    }
}

/// One incentive tier. Evidence is counted inside
/// `[entry + start, entry + end + leniency)`; issuance is considered once
/// `elapsed >= end`.
#[derive(Debug, Clone, Copy)]
pub struct TierSpec {
    pub amount_usd: u32,
    pub start_day: i64,
    pub end_day: i64,
    pub leniency_days: i64,
    pub min_evidence: usize,
    pub evidence_activity: &'static str,
}

impl TierSpec {
    pub fn due_ms(&self) -> i64 {
        days_ms(self.end_day)
    }

    /// Evidence acceptance window in milliseconds since phase entry.
    pub fn evidence_window_ms(&self) -> (i64, i64) {
        (
            days_ms(self.start_day),
            days_ms(self.end_day + self.leniency_days),
        )
    }
}

/// The study catalog: all modules and tiers.
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    pub modules: &'static [ModuleSpec],
    pub tiers: &'static [TierSpec],
}

const ORIENTATION: ModuleSpec = ModuleSpec {
    name: "orientation",
    phase: Phase::Trial,
    start_day: 0,
    end_day: 4,
    shift_hour: 18,
    greeting: "Welcome to the study! Your first activities are ready. \
               Complete the onboarding survey and check in every day of \
               your trial period.",
    activities: &[
        ActivitySpec {
            name: "Onboarding Survey",
            cadence: Cadence::None,
            offsets_ms: &[0],
        },
        ActivitySpec {
            name: "Daily Check-In",
            cadence: Cadence::Daily,
            offsets_ms: &[0],
        },
    ],
};

const CORE_CHECK_INS: ModuleSpec = ModuleSpec {
    name: "core_check_ins",
    phase: Phase::Enrolled,
    start_day: 0,
    end_day: 32,
    shift_hour: 18,
    greeting: "You are enrolled! Daily and weekly check-ins run for the \
               whole study.",
    activities: &[
        ActivitySpec {
            name: "Daily Check-In",
            cadence: Cadence::Daily,
            offsets_ms: &[0],
        },
        ActivitySpec {
            name: "Weekly Check-In",
            cadence: Cadence::Weekly,
            offsets_ms: &[0],
        },
    ],
};

const GRATITUDE_JOURNAL: ModuleSpec = ModuleSpec {
    name: "gratitude_journal",
    phase: Phase::Enrolled,
    start_day: 0,
    end_day: 6,
    shift_hour: 18,
    // Journal prompt lands two hours after the check-in reminder.
    greeting: "This week's practice is the gratitude journal. A short \
               prompt will arrive each evening.",
    activities: &[ActivitySpec {
        name: "Gratitude Journal",
        cadence: Cadence::Daily,
        offsets_ms: &[2 * 60 * 60 * 1000],
    }],
};

const THOUGHT_PATTERNS_A: ModuleSpec = ModuleSpec {
    name: "thought_patterns_a",
    phase: Phase::Enrolled,
    start_day: 6,
    end_day: 13,
    shift_hour: 18,
    greeting: "New practice unlocked: noticing thought patterns. Give it a \
               try tonight.",
    activities: &[ActivitySpec {
        name: "Thought Patterns",
        cadence: Cadence::Daily,
        offsets_ms: &[0],
    }],
};

const THOUGHT_PATTERNS_B: ModuleSpec = ModuleSpec {
    name: "thought_patterns_b",
    phase: Phase::Enrolled,
    start_day: 20,
    end_day: 27,
    shift_hour: 18,
    greeting: "The thought patterns practice is back for a booster week.",
    activities: &[ActivitySpec {
        name: "Thought Patterns",
        cadence: Cadence::Daily,
        offsets_ms: &[0],
    }],
};

static MODULES: &[ModuleSpec] = &[
    ORIENTATION,
    CORE_CHECK_INS,
    GRATITUDE_JOURNAL,
    THOUGHT_PATTERNS_A,
    THOUGHT_PATTERNS_B,
];

static TIERS: &[TierSpec] = &[
    TierSpec {
        amount_usd: 15,
        start_day: 0,
        end_day: 7,
        leniency_days: 3,
        min_evidence: 1,
        evidence_activity: "Weekly Check-In",
    },
    TierSpec {
        amount_usd: 15,
        start_day: 7,
        end_day: 21,
        leniency_days: 3,
        min_evidence: 2,
        evidence_activity: "Weekly Check-In",
    },
    TierSpec {
        amount_usd: 20,
        start_day: 21,
        end_day: 28,
        leniency_days: 3,
        min_evidence: 1,
        evidence_activity: "Weekly Check-In",
    },
];

static STANDARD: Catalog = Catalog {
    modules: MODULES,
    tiers: TIERS,
};

impl Catalog {
    /// The built-in study catalog.
    pub fn standard() -> &'static Catalog {
        &STANDARD
    }

    pub fn module(&self, name: &str) -> Option<&'static ModuleSpec> {
        self.modules.iter().find(|m| m.name == name)
    }

    pub fn modules_for(&self, phase: Phase) -> impl Iterator<Item = &'static ModuleSpec> {
        self.modules.iter().filter(move |m| m.phase == phase)
    }

    /// Modules whose window contains `elapsed_ms` of the given phase.
    pub fn target_modules(&self, phase: Phase, elapsed_ms: i64) -> Vec<&'static ModuleSpec> {
        self.modules
            .iter()
            .filter(|m| m.phase == phase && m.window_contains(elapsed_ms))
            .collect()
    }

    /// Every activity name any module manages. Used for terminal teardown.
    pub fn managed_activities(&self) -> BTreeSet<&'static str> {
        self.modules
            .iter()
            .flat_map(|m| m.activities.iter().map(|a| a.name))
            .collect()
    }

    /// Sanity checks run by the CLI and the test suite.
    pub fn validate(&self) -> Result<()> {
        for m in self.modules {
            if m.end_day <= m.start_day {
                return Err(ValidationError::InvalidWindow {
                    start_ms: days_ms(m.start_day),
                    end_ms: days_ms(m.end_day),
                }
                .into());
            }
            if m.activities.is_empty() {
                return Err(ValidationError::InvalidValue {
                    field: format!("module.{}", m.name),
                    message: "module has no activities".into(),
                }
                .into());
            }
        }
        let managed = self.managed_activities();
        for (idx, t) in self.tiers.iter().enumerate() {
            if t.end_day <= t.start_day || t.leniency_days < 0 {
                return Err(ValidationError::InvalidWindow {
                    start_ms: days_ms(t.start_day),
                    end_ms: days_ms(t.end_day),
                }
                .into());
            }
            if !managed.contains(t.evidence_activity) {
                return Err(ValidationError::InvalidValue {
                    field: format!("tier.{}", idx + 1),
                    message: format!(
                        "evidence activity '{}' is not managed by any module",
                        t.evidence_activity
                    ),
                }
                .into());
            }
        }
        Ok(())
    }
}
