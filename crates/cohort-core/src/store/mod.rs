//! Attachment store: remote per-subject JSON documents.
//!
//! Every durable fact the runner works with is a small JSON document keyed
//! by `(subject, key)`. The store is non-transactional; engines get
//! correctness from protocol ordering and idempotent re-evaluation, never
//! from locking. Missing documents are an expected outcome and are
//! materialized with their defaults on first read.

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};

/// Per-participant document keys.
pub const KEY_PHASES: &str = "cohort.phases";
pub const KEY_MODULES: &str = "cohort.modules";
pub const KEY_LEDGER: &str = "cohort.ledger";
pub const KEY_QUALITY: &str = "cohort.quality";
pub const KEY_MESSAGES: &str = "cohort.messages";
pub const KEY_OUTREACH: &str = "cohort.outreach";
pub const KEY_GROUP: &str = "cohort.group";

/// Study-level shared document keys.
pub const KEY_GIFT_CODES: &str = "cohort.gift_codes";
pub const KEY_GROUP_COUNTER: &str = "cohort.group_counter";

/// Who a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject<'a> {
    /// Shared study-level documents (gift-code pool, group counter).
    Study,
    Participant(&'a str),
}

impl fmt::Display for Subject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Study => f.write_str("study"),
            Subject::Participant(id) => f.write_str(id),
        }
    }
}

/// Raw JSON document access. Implementations must be usable from multiple
/// threads; the runner itself is single-threaded but the CLI shares
/// references.
pub trait AttachmentStore: Send + Sync {
    /// Fetch a document; `Ok(None)` when the subject has no such key.
    fn get_raw(&self, subject: Subject<'_>, key: &str) -> Result<Option<Value>>;

    /// Write a document, replacing any previous value.
    fn put_raw(&self, subject: Subject<'_>, key: &str, value: Value) -> Result<()>;
}

/// Typed fetch; missing document yields `None`.
pub fn fetch<T: DeserializeOwned>(
    store: &dyn AttachmentStore,
    subject: Subject<'_>,
    key: &str,
) -> Result<Option<T>> {
    match store.get_raw(subject, key)? {
        Some(value) => {
            let doc = serde_json::from_value(value).map_err(|e| StoreError::Decode {
                key: key.to_string(),
                message: e.to_string(),
            })?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

/// Typed fetch with create-on-missing. The default is persisted so later
/// cycles and concurrent sweeps observe the same document.
pub fn fetch_or_create<T, F>(
    store: &dyn AttachmentStore,
    subject: Subject<'_>,
    key: &str,
    default: F,
) -> Result<T>
where
    T: DeserializeOwned + Serialize,
    F: FnOnce() -> T,
{
    if let Some(doc) = fetch(store, subject, key)? {
        return Ok(doc);
    }
    let fresh = default();
    save(store, subject, key, &fresh)?;
    Ok(fresh)
}

/// Typed write.
pub fn save<T: Serialize>(
    store: &dyn AttachmentStore,
    subject: Subject<'_>,
    key: &str,
    value: &T,
) -> Result<()> {
    store.put_raw(subject, key, serde_json::to_value(value)?)
}
