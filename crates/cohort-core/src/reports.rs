//! Weekly progress summaries for enrolled participants.

use std::collections::BTreeSet;

use crate::clock::{days_ms, DAY_MS};
use crate::error::Result;
use crate::outreach::{texts, Messenger, OutreachKind};
use crate::phase::{Phase, PhaseRecord};
use crate::runner::ParticipantCtx;

const DAILY_ACTIVITY: &str = "Daily Check-In";
const WEEKLY_ACTIVITY: &str = "Weekly Check-In";

/// Adherence numbers quoted in the weekly progress message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyStats {
    /// Consecutive days with a daily check-in, counting back from today
    /// (today itself may still be open).
    pub streak_days: i64,
    /// Share of enrolled days with at least one daily check-in.
    pub daily_pct: u32,
    pub weekly_done: usize,
}

pub fn compute_stats(ctx: &ParticipantCtx<'_>, enrolled_ms: i64, now_ms: i64) -> WeeklyStats {
    let ids_of = |name: &str| -> Vec<&str> {
        ctx.activities
            .iter()
            .filter(|a| a.name == name)
            .map(|a| a.id.as_str())
            .collect()
    };
    let daily_ids = ids_of(DAILY_ACTIVITY);
    let weekly_ids = ids_of(WEEKLY_ACTIVITY);

    // Day index since enrollment; one completion marks the whole day.
    let daily_days: BTreeSet<i64> = ctx
        .completions
        .iter()
        .filter(|c| c.at_ms >= enrolled_ms && daily_ids.iter().any(|id| *id == c.activity_id))
        .map(|c| (c.at_ms - enrolled_ms).div_euclid(DAY_MS))
        .collect();

    let today = (now_ms - enrolled_ms).div_euclid(DAY_MS);
    let mut cursor = if daily_days.contains(&today) {
        today
    } else {
        today - 1
    };
    let mut streak_days = 0;
    while cursor >= 0 && daily_days.contains(&cursor) {
        streak_days += 1;
        cursor -= 1;
    }

    let elapsed_days = ((now_ms - enrolled_ms).div_euclid(DAY_MS)).max(1);
    let daily_pct = ((daily_days.len() as i64 * 100) / elapsed_days).min(100) as u32;

    let weekly_done = ctx
        .completions
        .iter()
        .filter(|c| c.at_ms >= enrolled_ms && weekly_ids.iter().any(|id| *id == c.activity_id))
        .count();

    WeeklyStats {
        streak_days,
        daily_pct,
        weekly_done,
    }
}

/// Send the progress summary to an enrolled participant, at most once per
/// week and only after the first full week. Returns whether it went out.
pub fn maybe_send_weekly(
    messenger: &Messenger<'_>,
    ctx: &ParticipantCtx<'_>,
    record: &PhaseRecord,
    now_ms: i64,
) -> Result<bool> {
    if record.status != Phase::Enrolled {
        return Ok(false);
    }
    let Some(enrolled_ms) = record.entered_ms(Phase::Enrolled) else {
        return Ok(false);
    };
    if now_ms - enrolled_ms < days_ms(7) {
        return Ok(false);
    }
    let stats = compute_stats(ctx, enrolled_ms, now_ms);
    messenger.send_throttled(
        ctx.id,
        ctx.address,
        OutreachKind::WeeklyReport,
        &texts::weekly_progress(stats.streak_days, stats.daily_pct, stats.weekly_done),
        now_ms,
    )
}
