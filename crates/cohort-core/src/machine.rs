//! Phase machine: per-participant lifecycle evaluation.
//!
//! One pass per cycle per participant. Every trigger is recomputed from
//! the stored phase record, the completion feed, and the clock, so
//! re-running is idempotent and at most one transition happens per pass.
//! When a discontinuation trigger and a completion trigger hold on the
//! same pass, discontinuation wins.

use std::collections::HashSet;

use crate::catalog::Catalog;
use crate::clock::{days_ms, hours_ms, DAY_MS};
use crate::config::StudyConfig;
use crate::directory::ActivityDirectory;
use crate::error::Result;
use crate::ledger::IncentiveLedger;
use crate::notify::OpsChannel;
use crate::outreach::{texts, Messenger, OutreachKind};
use crate::phase::{Phase, PhaseRecord, QualitySnapshot};
use crate::pool::assign_group;
use crate::runner::ParticipantCtx;
use crate::store::{self, AttachmentStore, Subject, KEY_LEDGER, KEY_QUALITY};

/// A performed phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Phase,
    pub to: Phase,
}

pub struct PhaseMachine<'a> {
    store: &'a dyn AttachmentStore,
    directory: &'a dyn ActivityDirectory,
    messenger: &'a Messenger<'a>,
    ops: &'a OpsChannel,
    study: &'a StudyConfig,
    catalog: &'static Catalog,
}

impl<'a> PhaseMachine<'a> {
    pub fn new(
        store: &'a dyn AttachmentStore,
        directory: &'a dyn ActivityDirectory,
        messenger: &'a Messenger<'a>,
        ops: &'a OpsChannel,
        study: &'a StudyConfig,
        catalog: &'static Catalog,
    ) -> Self {
        PhaseMachine {
            store,
            directory,
            messenger,
            ops,
            study,
            catalog,
        }
    }

    /// Evaluate one participant, possibly advancing the stored record.
    pub fn evaluate(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &mut PhaseRecord,
        now_ms: i64,
    ) -> Result<Option<Transition>> {
        if record.status.is_terminal() {
            return Ok(None);
        }

        // Heal a record missing its own entry stamp before evaluating any
        // window against it.
        if record.entered_ms(record.status).is_none() {
            record.entered.insert(record.status, now_ms);
            self.save_record(ctx.id, record)?;
            return Ok(None);
        }

        match record.status {
            Phase::NewUser => self.eval_new_user(ctx, record, now_ms),
            Phase::Trial => self.eval_trial(ctx, record, now_ms),
            Phase::Enrolled => self.eval_enrolled(ctx, record, now_ms),
            Phase::Completed | Phase::Discontinued => Ok(None),
        }
    }

    // ── NewUser ──

    fn eval_new_user(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &mut PhaseRecord,
        now_ms: i64,
    ) -> Result<Option<Transition>> {
        let elapsed = record.elapsed_in(Phase::NewUser, now_ms).unwrap_or(0);
        if elapsed < hours_ms(self.study.new_user_dwell_hours) {
            return Ok(None);
        }

        record.advance(Phase::Trial, now_ms);
        self.save_record(ctx.id, record)?;
        self.send_once(ctx, &texts::welcome(), now_ms);
        Ok(Some(Transition {
            from: Phase::NewUser,
            to: Phase::Trial,
        }))
    }

    // ── Trial ──

    fn eval_trial(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &mut PhaseRecord,
        now_ms: i64,
    ) -> Result<Option<Transition>> {
        let elapsed = record.elapsed_in(Phase::Trial, now_ms).unwrap_or(0);
        let window = days_ms(self.study.trial_window_days);
        let entered = record.entered_ms(Phase::Trial).unwrap_or(now_ms);
        let missing = self.missing_trial_activities(ctx, entered);

        if elapsed < window {
            // Final-day nudge for anything still outstanding.
            if elapsed >= window - DAY_MS && !missing.is_empty() {
                self.messenger.send_throttled(
                    ctx.id,
                    ctx.address,
                    OutreachKind::TrialClosingWarning,
                    &texts::trial_closing(&missing),
                    now_ms,
                )?;
            }
            return Ok(None);
        }

        let quality: QualitySnapshot =
            store::fetch(self.store, Subject::Participant(ctx.id), KEY_QUALITY)?
                .unwrap_or_default();
        let quality_ok = quality.coverage >= self.study.quality_threshold;

        if missing.is_empty() && quality_ok {
            // Arm assignment is sticky, so do it before the phase stamp: a
            // failure here leaves the participant in Trial for a clean retry.
            let arm = assign_group(self.store, ctx.id, self.study.group_count)?;
            tracing::info!("participant {} assigned to arm {arm}", ctx.id);

            record.advance(Phase::Enrolled, now_ms);
            self.save_record(ctx.id, record)?;
            self.send_once(ctx, &texts::enrolled(), now_ms);
            return Ok(Some(Transition {
                from: Phase::Trial,
                to: Phase::Enrolled,
            }));
        }

        let mut reasons = Vec::new();
        if !missing.is_empty() {
            reasons.push(format!("incomplete trial activities: {}", missing.join(", ")));
        }
        if !quality_ok {
            reasons.push(format!(
                "passive data coverage {:.2} below threshold {:.2}",
                quality.coverage, self.study.quality_threshold
            ));
        }
        self.finish(ctx, record, Phase::Discontinued, &reasons.join("; "), now_ms)
            .map(Some)
    }

    /// Trial activities without a completion since trial entry, in catalog
    /// order. An activity the directory does not know counts as missing.
    fn missing_trial_activities(&self, ctx: &ParticipantCtx<'_>, entered_ms: i64) -> Vec<String> {
        let done: HashSet<&str> = ctx
            .completions
            .iter()
            .filter(|c| c.at_ms >= entered_ms)
            .map(|c| c.activity_id.as_str())
            .collect();

        let mut missing = Vec::new();
        for module in self.catalog.modules_for(Phase::Trial) {
            for spec in module.activities {
                let completed = ctx
                    .activities
                    .iter()
                    .filter(|a| a.name == spec.name)
                    .any(|a| done.contains(a.id.as_str()));
                if !completed {
                    missing.push(spec.name.to_string());
                }
            }
        }
        missing
    }

    // ── Enrolled ──

    fn eval_enrolled(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &mut PhaseRecord,
        now_ms: i64,
    ) -> Result<Option<Transition>> {
        let entered = record.entered_ms(Phase::Enrolled).unwrap_or(now_ms);
        let elapsed = now_ms - entered;

        // Discontinuation triggers are checked before completion triggers;
        // the precedence is deliberate policy.
        let last_active = ctx
            .completions
            .iter()
            .map(|c| c.at_ms)
            .max()
            .unwrap_or(entered)
            .max(entered);
        let inactive_ms = now_ms - last_active;

        if inactive_ms >= days_ms(self.study.inactivity_cut_days) {
            let reason = format!(
                "no activity for {} days",
                inactive_ms / DAY_MS
            );
            return self
                .finish(ctx, record, Phase::Discontinued, &reason, now_ms)
                .map(Some);
        }

        let gap = days_ms(self.study.weekly_gap_days);
        if elapsed >= gap {
            let last_weekly = self
                .completions_of(ctx, "Weekly Check-In")
                .into_iter()
                .max()
                .unwrap_or(entered);
            if now_ms - last_weekly >= gap {
                let reason = format!(
                    "no weekly check-in for {} days",
                    (now_ms - last_weekly) / DAY_MS
                );
                return self
                    .finish(ctx, record, Phase::Discontinued, &reason, now_ms)
                    .map(Some);
            }
        }

        if elapsed >= days_ms(self.study.close_days) {
            // Past the hard stop the ledger no longer holds completion up.
            let done = self.finish_quiet(ctx, record, Phase::Completed, now_ms)?;
            self.send_once(ctx, &texts::completed_late(), now_ms);
            return Ok(Some(done));
        }

        if elapsed >= days_ms(self.study.length_days) {
            let ledger: IncentiveLedger =
                store::fetch(self.store, Subject::Participant(ctx.id), KEY_LEDGER)?
                    .unwrap_or_default();
            if ledger.terminal_issued() {
                let done = self.finish_quiet(ctx, record, Phase::Completed, now_ms)?;
                self.send_once(ctx, &texts::completed(), now_ms);
                return Ok(Some(done));
            }
            tracing::warn!(
                "participant {} past study length, waiting on terminal tier",
                ctx.id
            );
        }

        // No transition; nudge if the quiet spell is getting long.
        let inactive_days = inactive_ms / DAY_MS;
        if inactive_days >= self.study.inactivity_warn_days {
            self.messenger.send_throttled(
                ctx.id,
                ctx.address,
                OutreachKind::InactivityWarning,
                &texts::inactivity_warning(inactive_days),
                now_ms,
            )?;
        }
        Ok(None)
    }

    // ── Terminal entry ──

    /// Terminal transition with an ops alert carrying the reason.
    fn finish(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &mut PhaseRecord,
        to: Phase,
        reason: &str,
        now_ms: i64,
    ) -> Result<Transition> {
        self.ops
            .alert(&format!("participant {} discontinued: {reason}", ctx.id));
        let done = self.finish_quiet(ctx, record, to, now_ms)?;
        self.send_once(ctx, &texts::discontinued(), now_ms);
        Ok(done)
    }

    /// Stamp a terminal phase and revoke passive collection. Schedule
    /// teardown converges via the reconciler in the same cycle.
    fn finish_quiet(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &mut PhaseRecord,
        to: Phase,
        now_ms: i64,
    ) -> Result<Transition> {
        let from = record.status;
        self.directory.revoke_sensors(ctx.id)?;
        record.advance(to, now_ms);
        self.save_record(ctx.id, record)?;
        tracing::info!("participant {} moved {from} -> {to}", ctx.id);
        Ok(Transition { from, to })
    }

    // ── Helpers ──

    fn save_record(&self, participant: &str, record: &PhaseRecord) -> Result<()> {
        store::save(
            self.store,
            Subject::Participant(participant),
            crate::store::KEY_PHASES,
            record,
        )
    }

    /// Completion timestamps of all activities with the given name.
    fn completions_of(&self, ctx: &ParticipantCtx<'_>, name: &str) -> Vec<i64> {
        let ids: HashSet<&str> = ctx
            .activities
            .iter()
            .filter(|a| a.name == name)
            .map(|a| a.id.as_str())
            .collect();
        ctx.completions
            .iter()
            .filter(|c| ids.contains(c.activity_id.as_str()))
            .map(|c| c.at_ms)
            .collect()
    }

    /// One-shot messages are best-effort: the transition that triggered
    /// them is already persisted, so a delivery failure is logged rather
    /// than turned into a participant skip that could never retry it.
    fn send_once(&self, ctx: &ParticipantCtx<'_>, notice: &crate::notify::Notice, now_ms: i64) {
        if let Err(e) = self.messenger.send(ctx.id, ctx.address, notice, now_ms) {
            tracing::warn!("message to {} not delivered: {e}", ctx.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HOUR_MS;
    use crate::directory::{ActivityDef, Completion, MemoryDirectory};
    use crate::notify::MemoryGateway;
    use crate::outreach::MessageLog;
    use crate::store::{MemoryStore, KEY_GROUP, KEY_MESSAGES, KEY_PHASES};

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        store: MemoryStore,
        directory: MemoryDirectory,
        gateway: MemoryGateway,
        ops: OpsChannel,
        study: StudyConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                store: MemoryStore::new(),
                directory: MemoryDirectory::new(),
                gateway: MemoryGateway::new(),
                ops: OpsChannel::new(None),
                study: StudyConfig::default(),
            }
        }

        fn evaluate(
            &self,
            record: &mut PhaseRecord,
            completions: &[Completion],
            now_ms: i64,
        ) -> Option<Transition> {
            let messenger = Messenger::new(&self.store, &self.gateway, None);
            let machine = PhaseMachine::new(
                &self.store,
                &self.directory,
                &messenger,
                &self.ops,
                &self.study,
                Catalog::standard(),
            );
            let activities = standard_activities();
            let ctx = ParticipantCtx {
                id: "p1",
                activities: &activities,
                completions,
                address: None,
            };
            machine.evaluate(&ctx, record, now_ms).unwrap()
        }

        fn message_subjects(&self) -> Vec<String> {
            let log: MessageLog =
                store::fetch(&self.store, Subject::Participant("p1"), KEY_MESSAGES)
                    .unwrap()
                    .unwrap_or_default();
            log.messages.iter().map(|m| m.subject.clone()).collect()
        }

        fn seed_quality(&self, coverage: f64) {
            store::save(
                &self.store,
                Subject::Participant("p1"),
                KEY_QUALITY,
                &QualitySnapshot {
                    coverage,
                    updated_ms: Some(T0),
                },
            )
            .unwrap();
        }

        fn seed_terminal_tier_issued(&self) {
            let mut ledger = IncentiveLedger::sized(3);
            ledger.tiers[2].code = "SEEDED".into();
            store::save(&self.store, Subject::Participant("p1"), KEY_LEDGER, &ledger).unwrap();
        }
    }

    fn standard_activities() -> Vec<ActivityDef> {
        [
            ("a-onboarding", "Onboarding Survey"),
            ("a-daily", "Daily Check-In"),
            ("a-weekly", "Weekly Check-In"),
            ("a-gratitude", "Gratitude Journal"),
            ("a-patterns", "Thought Patterns"),
        ]
        .into_iter()
        .map(|(id, name)| ActivityDef::new(id, name, "survey"))
        .collect()
    }

    fn done(activity_id: &str, at_ms: i64) -> Completion {
        Completion {
            activity_id: activity_id.into(),
            at_ms,
        }
    }

    fn trial_record(entered: i64) -> PhaseRecord {
        let mut rec = PhaseRecord::fresh(entered - hours_ms(2));
        rec.advance(Phase::Trial, entered);
        rec
    }

    fn enrolled_record(entered: i64) -> PhaseRecord {
        let mut rec = trial_record(entered - days_ms(4));
        rec.advance(Phase::Enrolled, entered);
        rec
    }

    // ── NewUser ──

    #[test]
    fn dwell_holds_then_promotes_with_welcome() {
        let fx = Fixture::new();
        let mut record = PhaseRecord::fresh(T0);

        assert_eq!(fx.evaluate(&mut record, &[], T0 + HOUR_MS), None);
        assert_eq!(record.status, Phase::NewUser);

        let t = fx.evaluate(&mut record, &[], T0 + hours_ms(2)).unwrap();
        assert_eq!(t.to, Phase::Trial);
        assert_eq!(record.entered_ms(Phase::Trial), Some(T0 + hours_ms(2)));
        assert_eq!(fx.message_subjects(), vec!["Welcome to the study"]);
        // The transition was persisted.
        let stored: PhaseRecord =
            store::fetch(&fx.store, Subject::Participant("p1"), KEY_PHASES)
                .unwrap()
                .unwrap();
        assert_eq!(stored.status, Phase::Trial);
    }

    #[test]
    fn missing_entry_stamp_is_healed_without_transition() {
        let fx = Fixture::new();
        let mut record = PhaseRecord {
            status: Phase::Trial,
            entered: Default::default(),
        };
        assert_eq!(fx.evaluate(&mut record, &[], T0), None);
        assert_eq!(record.entered_ms(Phase::Trial), Some(T0));
    }

    // ── Trial ──

    #[test]
    fn trial_passes_with_completions_and_coverage() {
        let fx = Fixture::new();
        fx.seed_quality(0.7);
        let mut record = trial_record(T0);
        let completions = [
            done("a-onboarding", T0 + days_ms(1)),
            done("a-daily", T0 + days_ms(2)),
        ];

        let at = T0 + days_ms(4) + HOUR_MS;
        let t = fx.evaluate(&mut record, &completions, at).unwrap();
        assert_eq!(t.from, Phase::Trial);
        assert_eq!(t.to, Phase::Enrolled);
        assert_eq!(record.entered_ms(Phase::Enrolled), Some(at));
        let arm: Option<u32> =
            store::fetch(&fx.store, Subject::Participant("p1"), KEY_GROUP).unwrap();
        assert_eq!(arm, Some(0));
        assert!(fx.message_subjects().contains(&"You are enrolled".to_string()));
    }

    #[test]
    fn trial_fails_on_missing_completion() {
        let fx = Fixture::new();
        fx.seed_quality(0.9);
        let mut record = trial_record(T0);
        // Daily check-in done, onboarding survey never submitted.
        let completions = [done("a-daily", T0 + days_ms(1))];

        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(4) + HOUR_MS)
            .unwrap();
        assert_eq!(t.to, Phase::Discontinued);
        assert_eq!(fx.ops.alert_count(), 1);
        assert!(fx.directory.sensors_revoked("p1"));
        // A failed trial never draws from the group counter.
        let arm: Option<u32> =
            store::fetch(&fx.store, Subject::Participant("p1"), KEY_GROUP).unwrap();
        assert_eq!(arm, None);
    }

    #[test]
    fn trial_fails_on_low_coverage_even_with_completions() {
        let fx = Fixture::new();
        fx.seed_quality(0.4);
        let mut record = trial_record(T0);
        let completions = [
            done("a-onboarding", T0 + HOUR_MS),
            done("a-daily", T0 + days_ms(3)),
        ];
        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(4))
            .unwrap();
        assert_eq!(t.to, Phase::Discontinued);
    }

    #[test]
    fn missing_quality_snapshot_reads_as_zero_coverage() {
        let fx = Fixture::new();
        let mut record = trial_record(T0);
        let completions = [
            done("a-onboarding", T0 + HOUR_MS),
            done("a-daily", T0 + days_ms(3)),
        ];
        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(4))
            .unwrap();
        assert_eq!(t.to, Phase::Discontinued);
    }

    #[test]
    fn completions_before_trial_entry_do_not_count() {
        let fx = Fixture::new();
        fx.seed_quality(0.9);
        let mut record = trial_record(T0);
        let completions = [
            done("a-onboarding", T0 - HOUR_MS),
            done("a-daily", T0 + days_ms(1)),
        ];
        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(4))
            .unwrap();
        assert_eq!(t.to, Phase::Discontinued);
    }

    #[test]
    fn final_trial_day_nudges_outstanding_activities_once() {
        let fx = Fixture::new();
        let mut record = trial_record(T0);
        let completions = [done("a-daily", T0 + days_ms(1))];

        // Day 2: quiet.
        assert_eq!(fx.evaluate(&mut record, &completions, T0 + days_ms(2)), None);
        assert!(fx.message_subjects().is_empty());

        // Final day: nudge names the missing survey, once per day.
        let at = T0 + days_ms(3) + HOUR_MS;
        assert_eq!(fx.evaluate(&mut record, &completions, at), None);
        assert_eq!(
            fx.message_subjects(),
            vec!["Your trial period ends tomorrow"]
        );
        assert_eq!(fx.evaluate(&mut record, &completions, at + HOUR_MS), None);
        assert_eq!(fx.message_subjects().len(), 1);
    }

    // ── Enrolled ──

    #[test]
    fn sustained_inactivity_discontinues() {
        let fx = Fixture::new();
        let mut record = enrolled_record(T0);
        let t = fx.evaluate(&mut record, &[], T0 + days_ms(5)).unwrap();
        assert_eq!(t.to, Phase::Discontinued);
        assert!(fx.directory.sensors_revoked("p1"));
        assert!(fx
            .message_subjects()
            .contains(&"Study participation ended".to_string()));
    }

    #[test]
    fn inactivity_warning_lands_before_the_cut() {
        let fx = Fixture::new();
        let mut record = enrolled_record(T0);
        let completions = [done("a-daily", T0 + HOUR_MS)];

        assert_eq!(
            fx.evaluate(&mut record, &completions, T0 + days_ms(3) + 2 * HOUR_MS),
            None
        );
        assert_eq!(record.status, Phase::Enrolled);
        assert_eq!(fx.message_subjects(), vec!["We miss your check-ins"]);
    }

    #[test]
    fn weekly_gap_discontinues_despite_daily_activity() {
        let fx = Fixture::new();
        let mut record = enrolled_record(T0);
        // Daily check-ins every single day, but never the weekly.
        let completions: Vec<Completion> = (0..10)
            .map(|d| done("a-daily", T0 + days_ms(d) + HOUR_MS))
            .collect();

        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(10))
            .unwrap();
        assert_eq!(t.to, Phase::Discontinued);
        assert_eq!(fx.ops.alert_count(), 1);
    }

    #[test]
    fn discontinuation_wins_over_completion_on_the_same_pass() {
        let fx = Fixture::new();
        fx.seed_terminal_tier_issued();
        let mut record = enrolled_record(T0);
        // Active recently, but the last weekly check-in was 11 days ago.
        let completions = [
            done("a-weekly", T0 + days_ms(17)),
            done("a-daily", T0 + days_ms(27)),
        ];

        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(28))
            .unwrap();
        assert_eq!(t.to, Phase::Discontinued);
    }

    #[test]
    fn completion_waits_for_the_terminal_tier() {
        let fx = Fixture::new();
        let mut record = enrolled_record(T0);
        let completions = [
            done("a-weekly", T0 + days_ms(27)),
            done("a-daily", T0 + days_ms(27) + HOUR_MS),
        ];

        // Day 28, terminal tier not issued: stays enrolled.
        assert_eq!(
            fx.evaluate(&mut record, &completions, T0 + days_ms(28)),
            None
        );
        assert_eq!(record.status, Phase::Enrolled);

        // Terminal tier issued: completes with the thank-you message.
        fx.seed_terminal_tier_issued();
        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(28) + HOUR_MS)
            .unwrap();
        assert_eq!(t.to, Phase::Completed);
        assert!(fx.message_subjects().contains(&"Study complete".to_string()));
    }

    #[test]
    fn hard_stop_completes_with_the_closure_message() {
        let fx = Fixture::new();
        let mut record = enrolled_record(T0);
        // Fresh weekly and daily activity so no discontinuation trigger
        // holds; the ledger still has no terminal tier.
        let completions = [
            done("a-weekly", T0 + days_ms(31)),
            done("a-daily", T0 + days_ms(31) + HOUR_MS),
        ];

        let t = fx
            .evaluate(&mut record, &completions, T0 + days_ms(32))
            .unwrap();
        assert_eq!(t.to, Phase::Completed);
        assert_eq!(fx.message_subjects(), vec!["Study closed"]);
    }

    #[test]
    fn terminal_records_are_never_reevaluated() {
        let fx = Fixture::new();
        let mut record = enrolled_record(T0);
        record.advance(Phase::Completed, T0 + days_ms(28));
        assert_eq!(fx.evaluate(&mut record, &[], T0 + days_ms(40)), None);
        assert_eq!(record.status, Phase::Completed);
        // No writes at all for a terminal record.
        assert_eq!(fx.store.write_count(), 0);
    }
}
