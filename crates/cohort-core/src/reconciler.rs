//! Schedule reconciler: make directory schedules match the module plan.
//!
//! The diff is computed on module membership only. Activation writes the
//! full intended schedule of every activity in the module (replacement,
//! not patching) and appends the assignment row; deactivation unschedules
//! a module's activities except those any target module still claims (the
//! keep-list), then drops the row. A converged participant produces zero
//! directory writes.

use std::collections::BTreeSet;

use rand::Rng;

use crate::catalog::{ActivitySpec, Catalog, ModuleSpec};
use crate::clock::hours_ms;
use crate::directory::{ActivityDef, ActivityDirectory, ScheduleEntry};
use crate::error::{CatalogError, Result};
use crate::notify::OpsChannel;
use crate::outreach::{texts, Messenger};
use crate::phase::{AssignmentRecord, ModuleAssignment, PhaseRecord};
use crate::runner::ParticipantCtx;
use crate::store::{self, AttachmentStore, Subject, KEY_MODULES};

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone)]
pub struct ReconcileOutcome {
    pub activated: Vec<String>,
    pub removed: Vec<String>,
    /// Module activations aborted because the directory was missing an
    /// activity. Membership is left unchanged so the next cycle retries.
    pub aborted: Vec<String>,
    pub schedule_writes: usize,
}

pub struct ScheduleReconciler<'a> {
    store: &'a dyn AttachmentStore,
    directory: &'a dyn ActivityDirectory,
    messenger: &'a Messenger<'a>,
    ops: &'a OpsChannel,
    catalog: &'static Catalog,
}

impl<'a> ScheduleReconciler<'a> {
    pub fn new(
        store: &'a dyn AttachmentStore,
        directory: &'a dyn ActivityDirectory,
        messenger: &'a Messenger<'a>,
        ops: &'a OpsChannel,
        catalog: &'static Catalog,
    ) -> Self {
        ScheduleReconciler {
            store,
            directory,
            messenger,
            ops,
            catalog,
        }
    }

    pub fn reconcile(
        &self,
        ctx: &ParticipantCtx<'_>,
        record: &PhaseRecord,
        now_ms: i64,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let me = Subject::Participant(ctx.id);

        // 1. Target membership for the current phase window. Terminal
        //    phases target nothing, which turns this pass into teardown.
        let target: Vec<&'static ModuleSpec> = if record.status.is_terminal() {
            Vec::new()
        } else {
            let elapsed = record.elapsed_in(record.status, now_ms).unwrap_or(0);
            self.catalog.target_modules(record.status, elapsed)
        };
        let keep: BTreeSet<&str> = target
            .iter()
            .flat_map(|m| m.activities.iter().map(|a| a.name))
            .collect();

        // 2. Stored membership.
        let mut assigned: AssignmentRecord =
            store::fetch_or_create(self.store, me, KEY_MODULES, AssignmentRecord::default)?;
        let mut changed = false;

        // 3. Deactivate rows no longer in the target set, keep-list aside.
        let stale: Vec<ModuleAssignment> = assigned
            .modules
            .iter()
            .filter(|row| !target.iter().any(|m| m.name == row.name && m.phase == row.phase))
            .cloned()
            .collect();
        for row in stale {
            match self.catalog.module(&row.name) {
                Some(spec) => {
                    outcome.schedule_writes +=
                        self.unschedule_module(ctx.activities, spec.activities, &keep)?;
                }
                None => {
                    // Row from a catalog this build no longer carries; we
                    // cannot enumerate its activities, only drop the row.
                    self.ops.alert(&format!(
                        "{}: {}",
                        ctx.id,
                        CatalogError::UnknownModule(row.name.clone())
                    ));
                }
            }
            assigned.remove(&row.name, row.phase);
            outcome.removed.push(row.name);
            changed = true;
        }

        // 4. Activate target modules that are not yet members.
        let entered = record.entered_ms(record.status).unwrap_or(now_ms);
        for module in &target {
            if assigned.contains(module.name, module.phase) {
                continue;
            }

            // Resolve every activity before writing anything: a module is
            // never half-activated.
            let mut resolved: Vec<(&ActivitySpec, &ActivityDef)> = Vec::new();
            let mut missing = None;
            for spec in module.activities {
                match ctx.activities.iter().find(|a| a.name == spec.name) {
                    Some(def) => resolved.push((spec, def)),
                    None => {
                        missing = Some(spec.name);
                        break;
                    }
                }
            }
            if let Some(name) = missing {
                let err = CatalogError::MissingActivity {
                    module: module.name.to_string(),
                    activity: name.to_string(),
                };
                self.ops.alert(&format!("{}: {err}", ctx.id));
                outcome.aborted.push(module.name.to_string());
                continue;
            }

            for (spec, def) in &resolved {
                let entries = build_entries(entered, module, spec);
                self.directory.set_schedule(&def.id, &entries)?;
                outcome.schedule_writes += 1;
            }

            let (start_ms, end_ms) = module.window_ms();
            assigned.modules.push(ModuleAssignment {
                name: module.name.to_string(),
                phase: module.phase,
                start_ms,
                end_ms,
                shift_hour: module.shift_hour,
            });
            changed = true;
            outcome.activated.push(module.name.to_string());

            // Greeting is tied to the membership change, hence sent once.
            if let Err(e) = self.messenger.send(
                ctx.id,
                ctx.address,
                &texts::module_greeting(module.greeting),
                now_ms,
            ) {
                tracing::warn!("greeting for {} not delivered: {e}", ctx.id);
            }
        }

        // 5. Persist membership only when it moved.
        if changed {
            store::save(self.store, me, KEY_MODULES, &assigned)?;
        }
        if !outcome.activated.is_empty() || !outcome.removed.is_empty() {
            tracing::info!(
                "participant {}: activated {:?}, removed {:?}",
                ctx.id,
                outcome.activated,
                outcome.removed
            );
        }
        Ok(outcome)
    }

    /// Empty the schedules of a module's activities, skipping keep-listed
    /// names and activities the directory no longer knows. Returns the
    /// number of writes.
    fn unschedule_module(
        &self,
        activities: &[ActivityDef],
        specs: &[ActivitySpec],
        keep: &BTreeSet<&str>,
    ) -> Result<usize> {
        let mut writes = 0;
        for spec in specs {
            if keep.contains(spec.name) {
                continue;
            }
            for def in activities.iter().filter(|a| a.name == spec.name) {
                if def.schedule.is_empty() {
                    continue;
                }
                self.directory.set_schedule(&def.id, &[])?;
                writes += 1;
            }
        }
        Ok(writes)
    }
}

/// Schedule entries for one activity of a module:
/// `fire_at = phase entry + shift hour + offset`, one entry per offset.
fn build_entries(entered_ms: i64, module: &ModuleSpec, spec: &ActivitySpec) -> Vec<ScheduleEntry> {
    let mut rng = rand::thread_rng();
    spec.offsets_ms
        .iter()
        .map(|offset| ScheduleEntry {
            fire_at_ms: entered_ms + hours_ms(module.shift_hour as i64) + offset,
            cadence: spec.cadence,
            notification_token: rng.gen_range(1..100_000),
        })
        .collect()
}
