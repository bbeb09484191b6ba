//! # Cohort Core Library
//!
//! This library is the administration core for a longitudinal behavioral
//! health study. A stateless runner sweeps the participant roster on a
//! fixed interval and drives three engines per participant: the phase
//! machine (lifecycle transitions), the schedule reconciler (activity
//! schedules follow the phase), and the incentive engine (tiered gift-code
//! compensation). All durable state lives in small JSON documents on a
//! remote, non-transactional store; correctness comes from idempotent
//! re-evaluation and ordered writes, never from locks.
//!
//! ## Architecture
//!
//! - **Phase Machine**: NewUser → Trial → Enrolled → Completed or
//!   Discontinued, with every trigger recomputed from stored timestamps
//! - **Reconciler**: diffs module membership against the static catalog
//!   and converges directory schedules, including terminal teardown
//! - **Incentives**: strictly gated tiers, at-most-once code disbursement,
//!   crash-leftover pool reconciliation
//! - **Collaborators**: attachment store, activity directory, and
//!   notification gateway are trait seams with HTTP and in-memory backends
//!
//! ## Key Components
//!
//! - [`Runner`]: one cycle over the roster
//! - [`PhaseMachine`]: lifecycle evaluation
//! - [`ScheduleReconciler`]: schedule convergence
//! - [`IncentiveEngine`]: ledger evaluation and disbursement
//! - [`Catalog`]: the static module and tier tables

pub mod catalog;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod incentives;
pub mod ledger;
pub mod machine;
pub mod notify;
pub mod outreach;
pub mod phase;
pub mod pool;
pub mod reconciler;
pub mod reports;
pub mod runner;
pub mod store;

pub use catalog::{ActivitySpec, Catalog, ModuleSpec, TierSpec};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{ApiConfig, CoreConfig, OpsConfig, StudyConfig};
pub use directory::{
    ActivityDef, ActivityDirectory, Cadence, Completion, HttpDirectory, MemoryDirectory,
    ScheduleEntry,
};
pub use error::{
    CatalogError, ConfigError, CoreError, Result, StoreError, ValidationError,
};
pub use incentives::{IncentiveEngine, IncentiveOutcome};
pub use ledger::{amount_label, IncentiveLedger, TierState};
pub use machine::{PhaseMachine, Transition};
pub use notify::{Address, MemoryGateway, Notice, NotificationGateway, OpsChannel, PushGateway};
pub use outreach::{Messenger, OutreachKind};
pub use phase::{AssignmentRecord, ModuleAssignment, Phase, PhaseRecord, QualitySnapshot};
pub use pool::GiftCodePool;
pub use reconciler::{ReconcileOutcome, ScheduleReconciler};
pub use runner::{CycleReport, ParticipantCtx, Runner};
pub use store::{AttachmentStore, HttpStore, MemoryStore, Subject};
