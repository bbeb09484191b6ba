//! Shared mutable study documents: gift-code pool and group counter.
//!
//! Both documents are written by every runner instance without any store
//! transaction. Writers follow an optimistic read-check-write protocol:
//! write, read back, and treat a mismatch as a concurrent writer having
//! won. Losing is safe; the affected step is retried or left to the next
//! cycle.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::store::{
    self, AttachmentStore, Subject, KEY_GIFT_CODES, KEY_GROUP, KEY_GROUP_COUNTER,
};

const COUNTER_RETRIES: usize = 3;

/// Study-level pool of unused prepaid codes, keyed by amount label
/// (`"$15"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GiftCodePool {
    #[serde(default)]
    pub codes: BTreeMap<String, Vec<String>>,
}

impl GiftCodePool {
    pub fn count(&self, label: &str) -> usize {
        self.codes.get(label).map(Vec::len).unwrap_or(0)
    }

    /// Take the oldest code for an amount, if any.
    pub fn pop(&mut self, label: &str) -> Option<String> {
        let list = self.codes.get_mut(label)?;
        if list.is_empty() {
            return None;
        }
        Some(list.remove(0))
    }

    /// Drop a specific code wherever it appears. Returns whether anything
    /// was removed.
    pub fn remove_code(&mut self, label: &str, code: &str) -> bool {
        let Some(list) = self.codes.get_mut(label) else {
            return false;
        };
        let before = list.len();
        list.retain(|c| c != code);
        list.len() != before
    }

    pub fn add(&mut self, label: &str, new_codes: impl IntoIterator<Item = String>) {
        self.codes.entry(label.to_string()).or_default().extend(new_codes);
    }

    /// Remaining codes per amount, for reports and the ops CLI.
    pub fn levels(&self) -> Vec<(String, usize)> {
        self.codes
            .iter()
            .map(|(label, list)| (label.clone(), list.len()))
            .collect()
    }
}

/// Load the shared pool, materializing an empty one on first touch.
pub fn load_pool(store: &dyn AttachmentStore) -> Result<GiftCodePool> {
    store::fetch_or_create(store, Subject::Study, KEY_GIFT_CODES, GiftCodePool::default)
}

pub fn save_pool(store: &dyn AttachmentStore, pool: &GiftCodePool) -> Result<()> {
    store::save(store, Subject::Study, KEY_GIFT_CODES, pool)
}

/// Round-robin experiment-arm assignment over the shared counter.
///
/// Idempotent per participant: an existing assignment is returned as-is.
/// The counter write is verified by readback; after `COUNTER_RETRIES`
/// lost races the caller gets a `WriteConflict` and the participant is
/// picked up again next cycle.
pub fn assign_group(
    store: &dyn AttachmentStore,
    participant: &str,
    group_count: u32,
) -> Result<u32> {
    debug_assert!(group_count > 0);
    let me = Subject::Participant(participant);
    if let Some(existing) = store::fetch::<u32>(store, me, KEY_GROUP)? {
        return Ok(existing);
    }

    for _ in 0..COUNTER_RETRIES {
        let counter: u32 = store::fetch(store, Subject::Study, KEY_GROUP_COUNTER)?.unwrap_or(0);
        let arm = counter % group_count.max(1);
        let next = counter.wrapping_add(1);
        store::save(store, Subject::Study, KEY_GROUP_COUNTER, &next)?;
        let readback: Option<u32> = store::fetch(store, Subject::Study, KEY_GROUP_COUNTER)?;
        if readback == Some(next) {
            store::save(store, me, KEY_GROUP, &arm)?;
            return Ok(arm);
        }
    }
    Err(StoreError::WriteConflict {
        key: KEY_GROUP_COUNTER.to_string(),
    }
    .into())
}
