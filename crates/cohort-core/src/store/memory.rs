//! In-memory attachment store backend.
//!
//! Used by the test suite and by local dry runs. Behaves like the remote
//! store from the engines' point of view, including injectable per-subject
//! failures so sweep isolation can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::{AttachmentStore, Subject};

#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<(String, String), Value>>,
    failing: Mutex<HashSet<String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every access for this subject fail, as a downed remote would.
    pub fn fail_subject(&self, subject_id: &str) {
        self.failing.lock().unwrap().insert(subject_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Number of writes since construction.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_failure(&self, subject: Subject<'_>, key: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(&subject.to_string()) {
            return Err(StoreError::RequestFailed {
                key: key.to_string(),
                message: format!("injected failure for subject {subject}"),
            }
            .into());
        }
        Ok(())
    }
}

impl AttachmentStore for MemoryStore {
    fn get_raw(&self, subject: Subject<'_>, key: &str) -> Result<Option<Value>> {
        self.check_failure(subject, key)?;
        let docs = self.docs.lock().unwrap();
        Ok(docs.get(&(subject.to_string(), key.to_string())).cloned())
    }

    fn put_raw(&self, subject: Subject<'_>, key: &str, value: Value) -> Result<()> {
        self.check_failure(subject, key)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.docs
            .lock()
            .unwrap()
            .insert((subject.to_string(), key.to_string()), value);
        Ok(())
    }
}
