//! Participant outreach: message log, throttling, and message texts.
//!
//! Every participant-facing message is appended to the participant's
//! message-log document and then pushed through the gateway. Nudges,
//! reminders, and reports pass through a per-participant throttle so a
//! 15-minute sweep cadence cannot repeat them; transition messages, module
//! greetings, and disbursement notices are naturally once and bypass it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::clock::DAY_MS;
use crate::error::Result;
use crate::notify::{Address, NotificationGateway, Notice};
use crate::store::{self, AttachmentStore, Subject, KEY_MESSAGES, KEY_OUTREACH};

/// Throttled message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutreachKind {
    InactivityWarning,
    TrialClosingWarning,
    /// Tier index, zero-based.
    TierReminder(usize),
    WeeklyReport,
}

impl OutreachKind {
    fn key(self) -> String {
        match self {
            OutreachKind::InactivityWarning => "inactivity_warning".into(),
            OutreachKind::TrialClosingWarning => "trial_closing_warning".into(),
            OutreachKind::TierReminder(idx) => format!("tier_reminder_{}", idx + 1),
            OutreachKind::WeeklyReport => "weekly_report".into(),
        }
    }

    fn min_interval_ms(self) -> i64 {
        match self {
            OutreachKind::WeeklyReport => 7 * DAY_MS,
            _ => DAY_MS,
        }
    }
}

/// Append-only message history.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageLog {
    #[serde(default)]
    pub messages: Vec<MessageEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEntry {
    pub at_ms: i64,
    pub subject: String,
    pub body: String,
}

/// Last send time per throttled kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachLog {
    #[serde(default)]
    pub last_sent: BTreeMap<String, i64>,
}

/// Logs and delivers participant messages.
pub struct Messenger<'a> {
    store: &'a dyn AttachmentStore,
    gateway: &'a dyn NotificationGateway,
    support_email: Option<String>,
}

impl<'a> Messenger<'a> {
    pub fn new(
        store: &'a dyn AttachmentStore,
        gateway: &'a dyn NotificationGateway,
        support_email: Option<String>,
    ) -> Self {
        Messenger {
            store,
            gateway,
            support_email,
        }
    }

    /// Log and deliver. Without an address the message is logged only.
    /// The log write happens first so the record survives a failed push.
    pub fn send(
        &self,
        participant: &str,
        address: Option<&Address>,
        notice: &Notice,
        now_ms: i64,
    ) -> Result<()> {
        let me = Subject::Participant(participant);
        let mut body = notice.body.clone();
        if let Some(support) = &self.support_email {
            body.push_str(&format!("\n\nQuestions? Contact {support}."));
        }
        let delivered = Notice::new(notice.subject.clone(), body);

        let mut log: MessageLog =
            store::fetch_or_create(self.store, me, KEY_MESSAGES, MessageLog::default)?;
        log.messages.push(MessageEntry {
            at_ms: now_ms,
            subject: delivered.subject.clone(),
            body: delivered.body.clone(),
        });
        store::save(self.store, me, KEY_MESSAGES, &log)?;

        if let Some(addr) = address {
            self.gateway.send(addr, &delivered)?;
        } else {
            tracing::debug!("no contact address for {participant}; message logged only");
        }
        Ok(())
    }

    /// Throttled send. Returns `Ok(false)` when suppressed. The throttle
    /// stamp is written only after a successful delivery, so a failed push
    /// is retried on the next cycle.
    pub fn send_throttled(
        &self,
        participant: &str,
        address: Option<&Address>,
        kind: OutreachKind,
        notice: &Notice,
        now_ms: i64,
    ) -> Result<bool> {
        let me = Subject::Participant(participant);
        let mut log: OutreachLog =
            store::fetch_or_create(self.store, me, KEY_OUTREACH, OutreachLog::default)?;
        if let Some(last) = log.last_sent.get(&kind.key()) {
            if now_ms - last < kind.min_interval_ms() {
                return Ok(false);
            }
        }
        self.send(participant, address, notice, now_ms)?;
        log.last_sent.insert(kind.key(), now_ms);
        store::save(self.store, me, KEY_OUTREACH, &log)?;
        Ok(true)
    }
}

// ── Message texts ──

pub mod texts {
    use crate::notify::Notice;

    pub fn welcome() -> Notice {
        Notice::new(
            "Welcome to the study",
            "Thanks for joining! Your trial period starts now. You will \
             find your first activities in the app.",
        )
    }

    pub fn enrolled() -> Notice {
        Notice::new(
            "You are enrolled",
            "Great work during the trial period. You are now fully \
             enrolled; new practices unlock as the weeks go on.",
        )
    }

    pub fn completed() -> Notice {
        Notice::new(
            "Study complete",
            "You have finished the study. Thank you for four weeks of \
             check-ins; your final compensation has been delivered.",
        )
    }

    /// Hard-stop closure past the maximum bound.
    pub fn completed_late() -> Notice {
        Notice::new(
            "Study closed",
            "The study window has closed and your participation has ended. \
             Thank you for taking part; our team will follow up about any \
             outstanding compensation.",
        )
    }

    pub fn discontinued() -> Notice {
        Notice::new(
            "Study participation ended",
            "Your participation in the study has ended and scheduled \
             activities have been removed from your app.",
        )
    }

    pub fn trial_closing(missing: &[String]) -> Notice {
        Notice::new(
            "Your trial period ends tomorrow",
            format!(
                "To continue into the full study, please complete: {}.",
                missing.join(", ")
            ),
        )
    }

    pub fn inactivity_warning(days_inactive: i64) -> Notice {
        Notice::new(
            "We miss your check-ins",
            format!(
                "We have not seen a check-in from you in {days_inactive} \
                 days. A quick daily check-in keeps you on track in the \
                 study."
            ),
        )
    }

    pub fn tier_reminder(tier_idx: usize, amount_usd: u32, form_url: Option<&str>) -> Notice {
        let mut body = format!(
            "You have earned the ${amount_usd} compensation for stage {} \
             of the study, but we still need your authorization form \
             before we can send it.",
            tier_idx + 1
        );
        if let Some(url) = form_url {
            body.push_str(&format!(" Complete it here: {url}"));
        }
        Notice::new("Action needed for your compensation", body)
    }

    pub fn disbursement(amount_usd: u32, code: &str) -> Notice {
        Notice::new(
            format!("Your ${amount_usd} gift code"),
            format!(
                "Thank you for staying on track! Your ${amount_usd} gift \
                 code is: {code}"
            ),
        )
    }

    pub fn module_greeting(greeting: &str) -> Notice {
        Notice::new("New activities this week", greeting.to_string())
    }

    pub fn weekly_progress(streak_days: i64, daily_pct: u32, weekly_done: usize) -> Notice {
        Notice::new(
            "Your week in the study",
            format!(
                "Current check-in streak: {streak_days} day(s). You have \
                 completed {daily_pct}% of your daily check-ins and \
                 {weekly_done} weekly check-in(s) so far. Keep it up!"
            ),
        )
    }
}
