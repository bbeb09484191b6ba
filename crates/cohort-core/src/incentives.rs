//! Incentive ledger evaluation and gift-code disbursement.
//!
//! Tiers are evaluated in catalog order against the completion feed. A tier
//! pays out once it is due, earned, externally authorized, and every earlier
//! tier has been issued. Disbursement follows a fixed write order against
//! the non-transactional store so that a crash at any point either issues
//! the code exactly once or leaves a divergence the next cycle repairs.

use crate::catalog::{Catalog, TierSpec};
use crate::clock::days_ms;
use crate::config::StudyConfig;
use crate::error::{Result, StoreError};
use crate::ledger::{amount_label, IncentiveLedger};
use crate::notify::OpsChannel;
use crate::outreach::{texts, Messenger, OutreachKind};
use crate::phase::{Phase, PhaseRecord};
use crate::pool::{load_pool, save_pool};
use crate::runner::ParticipantCtx;
use crate::store::{self, AttachmentStore, Subject, KEY_LEDGER};

/// What one ledger evaluation did.
#[derive(Debug, Default, Clone)]
pub struct IncentiveOutcome {
    /// Amounts issued this pass, in tier order.
    pub issued: Vec<u32>,
    pub reminders: usize,
    /// A due tier could not pay because its pool list was empty.
    pub pool_empty: bool,
    /// Codes found in both the ledger and the pool and removed from the
    /// pool (crash leftovers).
    pub reconciled: usize,
}

pub struct IncentiveEngine<'a> {
    store: &'a dyn AttachmentStore,
    messenger: &'a Messenger<'a>,
    ops: &'a OpsChannel,
    study: &'a StudyConfig,
    catalog: &'static Catalog,
    auth_form_url: Option<String>,
}

impl<'a> IncentiveEngine<'a> {
    pub fn new(
        store: &'a dyn AttachmentStore,
        messenger: &'a Messenger<'a>,
        ops: &'a OpsChannel,
        study: &'a StudyConfig,
        catalog: &'static Catalog,
        auth_form_url: Option<String>,
    ) -> Self {
        IncentiveEngine {
            store,
            messenger,
            ops,
            study,
            catalog,
            auth_form_url,
        }
    }

    pub fn evaluate(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &PhaseRecord,
        now_ms: i64,
    ) -> Result<IncentiveOutcome> {
        let mut outcome = IncentiveOutcome::default();

        // Compensation runs from enrollment. The clip bound freezes the
        // evidence of a discontinued participant at the moment they left.
        let Some(enrolled_ms) = record.entered_ms(Phase::Enrolled) else {
            return Ok(outcome);
        };
        let clip_ms = match record.status {
            Phase::Enrolled => None,
            Phase::Discontinued => {
                let left = record.entered_ms(Phase::Discontinued).unwrap_or(now_ms);
                if now_ms - left > days_ms(self.study.ledger_tail_days) {
                    return Ok(outcome);
                }
                Some(left)
            }
            _ => return Ok(outcome),
        };
        let elapsed = now_ms - enrolled_ms;

        let me = Subject::Participant(ctx.id);
        let tier_count = self.catalog.tiers.len();
        let mut ledger: IncentiveLedger = store::fetch_or_create(self.store, me, KEY_LEDGER, || {
            IncentiveLedger::sized(tier_count)
        })?;
        ledger.ensure_tiers(tier_count);

        // Pass 1: refresh earned flags from the completion feed.
        let mut dirty = false;
        for (idx, spec) in self.catalog.tiers.iter().enumerate() {
            if elapsed < spec.due_ms() || ledger.tiers[idx].earned {
                continue;
            }
            if self.evidence_count(ctx, spec, enrolled_ms, clip_ms) >= spec.min_evidence {
                ledger.tiers[idx].earned = true;
                dirty = true;
            }
        }
        if dirty {
            store::save(self.store, me, KEY_LEDGER, &ledger)?;
        }

        // Pass 2: sweep crash leftovers. A code recorded in the ledger must
        // not survive in the pool, or another participant could draw it.
        let already_issued: Vec<(String, String)> = self
            .catalog
            .tiers
            .iter()
            .zip(&ledger.tiers)
            .filter(|(_, state)| state.issued())
            .map(|(spec, state)| (amount_label(spec.amount_usd), state.code.clone()))
            .collect();
        if !already_issued.is_empty() {
            let mut pool = load_pool(self.store)?;
            let mut removed = 0;
            for (label, code) in &already_issued {
                if pool.remove_code(label, code) {
                    removed += 1;
                }
            }
            if removed > 0 {
                tracing::info!(
                    "participant {}: removed {removed} already-issued code(s) from the pool",
                    ctx.id
                );
                save_pool(self.store, &pool)?;
                outcome.reconciled = removed;
            }
        }

        // Pass 3: issue in strict tier order.
        for idx in 0..tier_count {
            let spec = &self.catalog.tiers[idx];
            if ledger.tiers[idx].issued() || elapsed < spec.due_ms() {
                continue;
            }
            if idx > 0 && !ledger.tiers[idx - 1].issued() {
                continue;
            }
            if !ledger.tiers[idx].earned {
                continue;
            }
            if !ledger.tiers[idx].authorized {
                let (_, evidence_end) = spec.evidence_window_ms();
                if elapsed < evidence_end {
                    let notice =
                        texts::tier_reminder(idx, spec.amount_usd, self.auth_form_url.as_deref());
                    if self.messenger.send_throttled(
                        ctx.id,
                        ctx.address,
                        OutreachKind::TierReminder(idx),
                        &notice,
                        now_ms,
                    )? {
                        outcome.reminders += 1;
                    }
                }
                continue;
            }
            if self.issue(ctx, &mut ledger, idx, spec, now_ms)? {
                outcome.issued.push(spec.amount_usd);
            } else {
                outcome.pool_empty = true;
            }
        }

        Ok(outcome)
    }

    /// Disbursement write order: pop in memory, write ledger, verify the
    /// write stuck, shrink the pool, notify. Returns `Ok(false)` when the
    /// pool had no code for the amount.
    fn issue(
        &self,
        ctx: &ParticipantCtx<'_>,
        ledger: &mut IncentiveLedger,
        idx: usize,
        spec: &TierSpec,
        now_ms: i64,
    ) -> Result<bool> {
        let me = Subject::Participant(ctx.id);
        let label = amount_label(spec.amount_usd);

        let mut pool = load_pool(self.store)?;
        let Some(code) = pool.pop(&label) else {
            self.ops.alert(&format!(
                "gift-code pool for {label} is empty; tier {} for {} deferred",
                idx + 1,
                ctx.id
            ));
            return Ok(false);
        };

        ledger.tiers[idx].code = code.clone();
        store::save(self.store, me, KEY_LEDGER, ledger)?;

        let written: IncentiveLedger =
            store::fetch(self.store, me, KEY_LEDGER)?.unwrap_or_default();
        if written.tier(idx).map(|t| t.code.as_str()) != Some(code.as_str()) {
            // Someone else wrote the ledger between our write and the
            // verify read. The pool still holds the code; nothing is lost.
            return Err(StoreError::WriteConflict {
                key: KEY_LEDGER.to_string(),
            }
            .into());
        }

        save_pool(self.store, &pool)?;
        tracing::info!("issued {label} (tier {}) to {}", idx + 1, ctx.id);

        if let Err(e) = self.messenger.send(
            ctx.id,
            ctx.address,
            &texts::disbursement(spec.amount_usd, &code),
            now_ms,
        ) {
            tracing::warn!("disbursement notice for {} not delivered: {e}", ctx.id);
        }
        Ok(true)
    }

    /// Completions of the tier's evidence activity inside the acceptance
    /// window, optionally clipped at discontinuation.
    fn evidence_count(
        &self,
        ctx: &ParticipantCtx<'_>,
        spec: &TierSpec,
        enrolled_ms: i64,
        clip_ms: Option<i64>,
    ) -> usize {
        let ids: Vec<&str> = ctx
            .activities
            .iter()
            .filter(|a| a.name == spec.evidence_activity)
            .map(|a| a.id.as_str())
            .collect();
        let (start, end) = spec.evidence_window_ms();
        let (start, end) = (enrolled_ms + start, enrolled_ms + end);
        ctx.completions
            .iter()
            .filter(|c| ids.iter().any(|id| *id == c.activity_id))
            .filter(|c| c.at_ms >= start && c.at_ms < end)
            .filter(|c| clip_ms.map(|clip| c.at_ms < clip).unwrap_or(true))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{days_ms, HOUR_MS};
    use crate::directory::{ActivityDef, Completion};
    use crate::notify::MemoryGateway;
    use crate::pool::GiftCodePool;
    use crate::store::MemoryStore;
    use serde_json::Value;

    const T0: i64 = 1_700_000_000_000;

    struct Fixture {
        store: MemoryStore,
        gateway: MemoryGateway,
        ops: OpsChannel,
        study: StudyConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                store: MemoryStore::new(),
                gateway: MemoryGateway::new(),
                ops: OpsChannel::new(None),
                study: StudyConfig::default(),
            }
        }

        fn seed_pool(&self, label: &str, codes: &[&str]) {
            let mut pool = GiftCodePool::default();
            pool.add(label, codes.iter().map(|c| c.to_string()));
            save_pool(&self.store, &pool).unwrap();
        }

        fn seed_ledger(&self, participant: &str, ledger: &IncentiveLedger) {
            store::save(
                &self.store,
                Subject::Participant(participant),
                KEY_LEDGER,
                ledger,
            )
            .unwrap();
        }

        fn ledger_of(&self, participant: &str) -> IncentiveLedger {
            store::fetch(&self.store, Subject::Participant(participant), KEY_LEDGER)
                .unwrap()
                .unwrap_or_default()
        }

        fn pool(&self) -> GiftCodePool {
            load_pool(&self.store).unwrap()
        }

        fn evaluate_with(
            &self,
            store: &dyn AttachmentStore,
            record: &PhaseRecord,
            completions: &[Completion],
            now_ms: i64,
        ) -> Result<IncentiveOutcome> {
            let messenger = Messenger::new(store, &self.gateway, None);
            let engine = IncentiveEngine::new(
                store,
                &messenger,
                &self.ops,
                &self.study,
                Catalog::standard(),
                Some("https://forms.example.org/auth".into()),
            );
            let activities = vec![
                ActivityDef::new("a-daily", "Daily Check-In", "survey"),
                ActivityDef::new("a-weekly", "Weekly Check-In", "survey"),
            ];
            let ctx = ParticipantCtx {
                id: "p1",
                activities: &activities,
                completions,
                address: None,
            };
            engine.evaluate(&ctx, record, now_ms)
        }

        fn evaluate(
            &self,
            record: &PhaseRecord,
            completions: &[Completion],
            now_ms: i64,
        ) -> IncentiveOutcome {
            self.evaluate_with(&self.store, record, completions, now_ms)
                .unwrap()
        }
    }

    fn enrolled_record(enrolled_ms: i64) -> PhaseRecord {
        let mut rec = PhaseRecord::fresh(enrolled_ms - days_ms(4));
        rec.advance(Phase::Trial, enrolled_ms - days_ms(4));
        rec.advance(Phase::Enrolled, enrolled_ms);
        rec
    }

    fn weekly(at_ms: i64) -> Completion {
        Completion {
            activity_id: "a-weekly".into(),
            at_ms,
        }
    }

    fn authorized_ledger(upto: usize) -> IncentiveLedger {
        let mut ledger = IncentiveLedger::sized(3);
        for tier in ledger.tiers.iter_mut().take(upto) {
            tier.authorized = true;
        }
        ledger
    }

    #[test]
    fn due_earned_authorized_tier_pays_out() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A", "CODE-B"]);
        fx.seed_ledger("p1", &authorized_ledger(1));
        let record = enrolled_record(T0);
        let completions = [weekly(T0 + days_ms(3))];

        let out = fx.evaluate(&record, &completions, T0 + days_ms(7) + HOUR_MS);
        assert_eq!(out.issued, vec![15]);
        assert!(!out.pool_empty);

        let ledger = fx.ledger_of("p1");
        assert!(ledger.tiers[0].earned);
        assert_eq!(ledger.tiers[0].code, "CODE-A");
        assert_eq!(fx.pool().count("$15"), 1);

        // The disbursement notice carries the code.
        let log: crate::outreach::MessageLog = store::fetch(
            &fx.store,
            Subject::Participant("p1"),
            crate::store::KEY_MESSAGES,
        )
        .unwrap()
        .unwrap();
        assert!(log.messages.last().unwrap().body.contains("CODE-A"));
    }

    #[test]
    fn issued_tier_never_pays_twice() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A", "CODE-B"]);
        fx.seed_ledger("p1", &authorized_ledger(1));
        let record = enrolled_record(T0);
        let completions = [weekly(T0 + days_ms(3))];

        fx.evaluate(&record, &completions, T0 + days_ms(7) + HOUR_MS);
        let out = fx.evaluate(&record, &completions, T0 + days_ms(7) + 2 * HOUR_MS);
        assert!(out.issued.is_empty());
        assert_eq!(fx.ledger_of("p1").tiers[0].code, "CODE-A");
        assert_eq!(fx.pool().count("$15"), 1);
    }

    #[test]
    fn empty_pool_defers_without_ledger_write() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &[]);
        fx.seed_ledger("p1", &authorized_ledger(1));
        let record = enrolled_record(T0);
        let completions = [weekly(T0 + days_ms(3))];

        let out = fx.evaluate(&record, &completions, T0 + days_ms(7) + HOUR_MS);
        assert!(out.pool_empty);
        assert!(out.issued.is_empty());
        assert_eq!(fx.ops.alert_count(), 1);
        assert!(!fx.ledger_of("p1").tiers[0].issued());

        // Restocking pays on the next pass.
        fx.seed_pool("$15", &["LATE-CODE"]);
        let out = fx.evaluate(&record, &completions, T0 + days_ms(7) + 2 * HOUR_MS);
        assert_eq!(out.issued, vec![15]);
        assert_eq!(fx.ledger_of("p1").tiers[0].code, "LATE-CODE");
    }

    #[test]
    fn unissued_earlier_tier_gates_later_ones() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A"]);
        fx.seed_pool("$20", &["CODE-Z"]);
        let mut ledger = authorized_ledger(3);
        // Tier 3 fully earned and authorized; tiers 1 and 2 never earned.
        ledger.tiers[2].earned = true;
        fx.seed_ledger("p1", &ledger);
        let record = enrolled_record(T0);
        let completions = [weekly(T0 + days_ms(22))];

        let out = fx.evaluate(&record, &completions, T0 + days_ms(28) + HOUR_MS);
        assert!(out.issued.is_empty());
        assert!(!fx.ledger_of("p1").tiers[2].issued());
    }

    #[test]
    fn unauthorized_earned_tier_sends_throttled_reminder() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A"]);
        let record = enrolled_record(T0);
        let completions = [weekly(T0 + days_ms(3))];

        // Inside leniency: one reminder, throttled on the repeat pass.
        let at = T0 + days_ms(8);
        let out = fx.evaluate(&record, &completions, at);
        assert_eq!(out.reminders, 1);
        assert!(out.issued.is_empty());
        let out = fx.evaluate(&record, &completions, at + HOUR_MS);
        assert_eq!(out.reminders, 0);

        // Past end + leniency the reminder stops.
        let out = fx.evaluate(&record, &completions, T0 + days_ms(10) + HOUR_MS);
        assert_eq!(out.reminders, 0);
    }

    #[test]
    fn leniency_accepts_evidence_past_nominal_end() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A"]);
        fx.seed_ledger("p1", &authorized_ledger(1));
        let record = enrolled_record(T0);
        // Only evidence lands on day 8, inside [0, 10).
        let completions = [weekly(T0 + days_ms(8))];

        let out = fx.evaluate(&record, &completions, T0 + days_ms(9));
        assert_eq!(out.issued, vec![15]);
    }

    #[test]
    fn crash_leftover_code_is_swept_from_pool() {
        let fx = Fixture::new();
        // Ledger already carries CODE-A (crash between ledger and pool
        // writes), and the pool still lists it.
        fx.seed_pool("$15", &["CODE-A", "CODE-B"]);
        let mut ledger = authorized_ledger(1);
        ledger.tiers[0].earned = true;
        ledger.tiers[0].code = "CODE-A".into();
        fx.seed_ledger("p1", &ledger);
        let record = enrolled_record(T0);

        let out = fx.evaluate(&record, &[], T0 + days_ms(7) + HOUR_MS);
        assert_eq!(out.reconciled, 1);
        assert!(out.issued.is_empty());
        let mut pool = fx.pool();
        assert_eq!(pool.count("$15"), 1);
        assert!(!pool.remove_code("$15", "CODE-A"));
    }

    #[test]
    fn discontinued_tail_clips_evidence_and_then_expires() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A"]);
        fx.seed_ledger("p1", &authorized_ledger(1));
        let mut record = enrolled_record(T0);
        let left_at = T0 + days_ms(8);
        record.advance(Phase::Discontinued, left_at);
        // One weekly before leaving, one after; only the first counts.
        let completions = [weekly(T0 + days_ms(6)), weekly(T0 + days_ms(9))];

        let out = fx.evaluate(&record, &completions, left_at + HOUR_MS);
        assert_eq!(out.issued, vec![15]);

        // Past the tail the ledger is closed even for earned tiers.
        let fx2 = Fixture::new();
        fx2.seed_pool("$15", &["CODE-A"]);
        fx2.seed_ledger("p1", &authorized_ledger(1));
        let out = fx2.evaluate(&record, &completions, left_at + days_ms(5));
        assert!(out.issued.is_empty());
        assert!(!fx2.ledger_of("p1").tiers[0].issued());
    }

    #[test]
    fn pre_enrollment_phases_are_not_evaluated() {
        let fx = Fixture::new();
        fx.seed_pool("$15", &["CODE-A"]);
        let mut record = PhaseRecord::fresh(T0);
        record.advance(Phase::Trial, T0);
        let out = fx.evaluate(&record, &[], T0 + days_ms(30));
        assert!(out.issued.is_empty());
        assert_eq!(out.reminders, 0);
    }

    /// Store wrapper that simulates a concurrent ledger writer: after the
    /// engine's ledger write, reads return a tampered copy.
    struct TamperedLedgerStore {
        inner: MemoryStore,
        tampered: std::sync::atomic::AtomicBool,
    }

    impl AttachmentStore for TamperedLedgerStore {
        fn get_raw(&self, subject: Subject<'_>, key: &str) -> Result<Option<Value>> {
            let mut value = self.inner.get_raw(subject, key)?;
            if key == KEY_LEDGER && self.tampered.load(std::sync::atomic::Ordering::SeqCst) {
                if let Some(Value::Object(map)) = &mut value {
                    if let Some(Value::Array(tiers)) = map.get_mut("tiers") {
                        if let Some(Value::Object(tier)) = tiers.first_mut() {
                            tier.insert("code".into(), Value::String("SOMEONE-ELSE".into()));
                        }
                    }
                }
            }
            Ok(value)
        }

        fn put_raw(&self, subject: Subject<'_>, key: &str, value: Value) -> Result<()> {
            self.inner.put_raw(subject, key, value)?;
            if key == KEY_LEDGER {
                self.tampered
                    .store(true, std::sync::atomic::Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[test]
    fn lost_ledger_write_aborts_before_the_pool_shrinks() {
        let fx = Fixture::new();
        let store = TamperedLedgerStore {
            inner: MemoryStore::new(),
            tampered: std::sync::atomic::AtomicBool::new(false),
        };
        let mut pool = GiftCodePool::default();
        pool.add("$15", ["CODE-A".to_string()]);
        save_pool(&store.inner, &pool).unwrap();
        // Seed beneath the wrapper so only the engine's own ledger write
        // arms the tamper.
        let mut ledger = authorized_ledger(1);
        ledger.tiers[0].earned = true;
        store::save(
            &store.inner,
            Subject::Participant("p1"),
            KEY_LEDGER,
            &ledger,
        )
        .unwrap();
        let record = enrolled_record(T0);
        let completions = [weekly(T0 + days_ms(3))];

        let err = fx
            .evaluate_with(&store, &record, &completions, T0 + days_ms(7) + HOUR_MS)
            .unwrap_err();
        assert!(err.to_string().contains("concurrent"));
        // The pool write never happened, so the code is still available.
        assert_eq!(load_pool(&store).unwrap().count("$15"), 1);
    }
}
