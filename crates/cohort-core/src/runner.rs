//! The cycle runner: one stateless sweep over the roster.
//!
//! Each cycle fetches the roster and, per participant, runs phase
//! evaluation, schedule reconciliation, and incentive evaluation against
//! one shared fetch of their directory data. A participant whose
//! collaborator calls fail is skipped with a warning; everyone else is
//! unaffected. The cycle ends with a summary pushed to the ops channel.

use std::collections::BTreeMap;

use crate::catalog::Catalog;
use crate::clock::{format_ms, Clock};
use crate::config::CoreConfig;
use crate::directory::{ActivityDef, ActivityDirectory, Completion};
use crate::error::Result;
use crate::incentives::IncentiveEngine;
use crate::machine::{PhaseMachine, Transition};
use crate::notify::{Address, NotificationGateway, OpsChannel};
use crate::outreach::Messenger;
use crate::phase::{Phase, PhaseRecord};
use crate::pool::GiftCodePool;
use crate::reconciler::ScheduleReconciler;
use crate::reports;
use crate::store::{self, AttachmentStore, Subject, KEY_GIFT_CODES, KEY_PHASES};

/// One participant's directory data, fetched once per cycle and shared by
/// every engine.
pub struct ParticipantCtx<'a> {
    pub id: &'a str,
    pub activities: &'a [ActivityDef],
    pub completions: &'a [Completion],
    pub address: Option<&'a Address>,
}

/// What one cycle did, for the ops report and the CLI.
#[derive(Debug, Default, Clone)]
pub struct CycleReport {
    pub started_ms: i64,
    pub participants: usize,
    pub census: BTreeMap<Phase, usize>,
    pub transitions: Vec<(String, Transition)>,
    pub schedule_writes: usize,
    pub codes_issued: usize,
    pub reminders: usize,
    pub reports_sent: usize,
    pub pool_levels: Vec<(String, usize)>,
    pub alerts: usize,
    pub skipped: Vec<(String, String)>,
}

impl CycleReport {
    pub fn render(&self) -> String {
        let mut lines = vec![format!("cycle at {}", format_ms(self.started_ms))];
        lines.push(format!(
            "participants: {} seen, {} skipped",
            self.participants,
            self.skipped.len()
        ));
        let census = Phase::ALL
            .iter()
            .map(|p| format!("{} {}", p.as_str(), self.census.get(p).copied().unwrap_or(0)))
            .collect::<Vec<_>>()
            .join(" | ");
        lines.push(format!("census: {census}"));
        if !self.transitions.is_empty() {
            let moved = self
                .transitions
                .iter()
                .map(|(id, t)| format!("{id} {} -> {}", t.from, t.to))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("transitions: {moved}"));
        }
        lines.push(format!(
            "schedule writes: {} | codes issued: {} | reminders: {} | weekly reports: {}",
            self.schedule_writes, self.codes_issued, self.reminders, self.reports_sent
        ));
        if !self.pool_levels.is_empty() {
            let pool = self
                .pool_levels
                .iter()
                .map(|(label, n)| format!("{label} x{n}"))
                .collect::<Vec<_>>()
                .join(" | ");
            lines.push(format!("pool: {pool}"));
        }
        lines.push(format!("alerts: {}", self.alerts));
        for (id, err) in &self.skipped {
            lines.push(format!("skipped {id}: {err}"));
        }
        lines.join("\n")
    }
}

struct ParticipantSweep {
    phase: Phase,
    transition: Option<Transition>,
    schedule_writes: usize,
    issued: usize,
    reminders: usize,
    report_sent: bool,
}

pub struct Runner<'a> {
    store: &'a dyn AttachmentStore,
    directory: &'a dyn ActivityDirectory,
    gateway: &'a dyn NotificationGateway,
    ops: &'a OpsChannel,
    clock: &'a dyn Clock,
    config: &'a CoreConfig,
    catalog: &'static Catalog,
}

impl<'a> Runner<'a> {
    pub fn new(
        store: &'a dyn AttachmentStore,
        directory: &'a dyn ActivityDirectory,
        gateway: &'a dyn NotificationGateway,
        ops: &'a OpsChannel,
        clock: &'a dyn Clock,
        config: &'a CoreConfig,
        catalog: &'static Catalog,
    ) -> Self {
        Runner {
            store,
            directory,
            gateway,
            ops,
            clock,
            config,
            catalog,
        }
    }

    /// One full sweep. Fails only when the roster itself cannot be
    /// fetched; per-participant failures are recorded and skipped.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let started_ms = self.clock.now_ms();
        let alerts_before = self.ops.alert_count();
        let roster = self.directory.participants()?;
        tracing::info!("cycle start: {} participant(s) on the roster", roster.len());

        let messenger = Messenger::new(
            self.store,
            self.gateway,
            self.config.ops.support_email.clone(),
        );
        let machine = PhaseMachine::new(
            self.store,
            self.directory,
            &messenger,
            self.ops,
            &self.config.study,
            self.catalog,
        );
        let reconciler = ScheduleReconciler::new(
            self.store,
            self.directory,
            &messenger,
            self.ops,
            self.catalog,
        );
        let incentives = IncentiveEngine::new(
            self.store,
            &messenger,
            self.ops,
            &self.config.study,
            self.catalog,
            self.config.ops.auth_form_url.clone(),
        );

        let mut report = CycleReport {
            started_ms,
            participants: roster.len(),
            ..CycleReport::default()
        };
        for id in &roster {
            match self.process_one(&machine, &reconciler, &incentives, &messenger, id, started_ms)
            {
                Ok(sweep) => {
                    *report.census.entry(sweep.phase).or_insert(0) += 1;
                    if let Some(t) = sweep.transition {
                        report.transitions.push((id.clone(), t));
                    }
                    report.schedule_writes += sweep.schedule_writes;
                    report.codes_issued += sweep.issued;
                    report.reminders += sweep.reminders;
                    if sweep.report_sent {
                        report.reports_sent += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("participant {id} skipped this cycle: {e}");
                    report.skipped.push((id.clone(), e.to_string()));
                }
            }
        }

        match store::fetch::<GiftCodePool>(self.store, Subject::Study, KEY_GIFT_CODES) {
            Ok(pool) => report.pool_levels = pool.unwrap_or_default().levels(),
            Err(e) => tracing::warn!("pool levels unavailable: {e}"),
        }
        report.alerts = self.ops.alert_count() - alerts_before;
        self.ops.report(&report.render());
        Ok(report)
    }

    fn process_one(
        &self,
        machine: &PhaseMachine<'_>,
        reconciler: &ScheduleReconciler<'_>,
        incentives: &IncentiveEngine<'_>,
        messenger: &Messenger<'_>,
        id: &str,
        now_ms: i64,
    ) -> Result<ParticipantSweep> {
        let mut record: PhaseRecord =
            store::fetch_or_create(self.store, Subject::Participant(id), KEY_PHASES, || {
                PhaseRecord::fresh(now_ms)
            })?;
        let activities = self.directory.activities(id)?;
        let completions = self.directory.completions(id)?;
        let address = self.directory.contact_address(id)?;
        let ctx = ParticipantCtx {
            id,
            activities: &activities,
            completions: &completions,
            address: address.as_ref(),
        };

        let transition = machine.evaluate(&ctx, &mut record, now_ms)?;
        let reconcile = reconciler.reconcile(&ctx, &record, now_ms)?;
        let incentive = incentives.evaluate(&ctx, &record, now_ms)?;
        let report_sent = reports::maybe_send_weekly(messenger, &ctx, &record, now_ms)?;

        Ok(ParticipantSweep {
            phase: record.status,
            transition,
            schedule_writes: reconcile.schedule_writes,
            issued: incentive.issued.len(),
            reminders: incentive.reminders,
            report_sent,
        })
    }
}
