//! Activity directory: the participant-facing side of the study platform.
//!
//! The directory owns the roster, activity definitions with their live
//! schedules, the completion feed, contact addresses, and passive sensor
//! registrations. The reconciler treats `set_schedule` as a full
//! replacement write; nothing here patches incrementally.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::error::{CoreError, Result};
use crate::notify::Address;

/// Repeat cadence of one schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    None,
    Daily,
    Weekly,
}

/// One slot in an activity's schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub fire_at_ms: i64,
    pub cadence: Cadence,
    pub notification_token: u32,
}

/// An activity definition as the directory stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDef {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntry>,
}

impl ActivityDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        ActivityDef {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            schedule: Vec::new(),
        }
    }
}

/// One completion event from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub activity_id: String,
    pub at_ms: i64,
}

/// Read/write access to the study platform's participant data.
pub trait ActivityDirectory: Send + Sync {
    /// Roster of participant ids for the sweep.
    fn participants(&self) -> Result<Vec<String>>;

    fn activities(&self, participant: &str) -> Result<Vec<ActivityDef>>;

    /// Replace the full schedule of one activity.
    fn set_schedule(&self, activity_id: &str, entries: &[ScheduleEntry]) -> Result<()>;

    fn completions(&self, participant: &str) -> Result<Vec<Completion>>;

    /// Where to reach the participant, if anywhere.
    fn contact_address(&self, participant: &str) -> Result<Option<Address>>;

    /// Tear down passive collection. Terminal phases only.
    fn revoke_sensors(&self, participant: &str) -> Result<()>;
}

// ── HTTP implementation ──

pub struct HttpDirectory {
    base_url: String,
    access_key: String,
    study_id: String,
    http_client: Client,
}

impl HttpDirectory {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        Ok(Self {
            base_url: api.validated_base_url()?,
            access_key: api.access_key.clone(),
            study_id: api.study_id.clone(),
            http_client: Client::new(),
        })
    }

    fn directory_err(message: impl Into<String>) -> CoreError {
        CoreError::gateway("directory", message)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .get(&url)
                    .bearer_auth(&self.access_key)
                    .send(),
            )
            .map_err(|e| Self::directory_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::directory_err(format!(
                "GET {url} returned HTTP {}",
                resp.status()
            )));
        }
        tokio::runtime::Handle::current()
            .block_on(resp.json::<T>())
            .map_err(|e| Self::directory_err(e.to_string()))
    }
}

#[derive(Deserialize)]
struct ParticipantRow {
    id: String,
}

impl ActivityDirectory for HttpDirectory {
    fn participants(&self) -> Result<Vec<String>> {
        let rows: Vec<ParticipantRow> =
            self.get_json(format!("{}/study/{}/participant", self.base_url, self.study_id))?;
        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    fn activities(&self, participant: &str) -> Result<Vec<ActivityDef>> {
        self.get_json(format!(
            "{}/participant/{}/activity",
            self.base_url, participant
        ))
    }

    fn set_schedule(&self, activity_id: &str, entries: &[ScheduleEntry]) -> Result<()> {
        let url = format!("{}/activity/{}/schedule", self.base_url, activity_id);
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .put(&url)
                    .bearer_auth(&self.access_key)
                    .json(&entries)
                    .send(),
            )
            .map_err(|e| Self::directory_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::directory_err(format!(
                "PUT {url} returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn completions(&self, participant: &str) -> Result<Vec<Completion>> {
        self.get_json(format!(
            "{}/participant/{}/completion",
            self.base_url, participant
        ))
    }

    fn contact_address(&self, participant: &str) -> Result<Option<Address>> {
        let url = format!("{}/participant/{}/contact", self.base_url, participant);
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .get(&url)
                    .bearer_auth(&self.access_key)
                    .send(),
            )
            .map_err(|e| Self::directory_err(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::directory_err(format!(
                "GET {url} returned HTTP {}",
                resp.status()
            )));
        }
        let address = tokio::runtime::Handle::current()
            .block_on(resp.json::<Address>())
            .map_err(|e| Self::directory_err(e.to_string()))?;
        Ok(Some(address))
    }

    fn revoke_sensors(&self, participant: &str) -> Result<()> {
        let url = format!("{}/participant/{}/sensor", self.base_url, participant);
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .delete(&url)
                    .bearer_auth(&self.access_key)
                    .send(),
            )
            .map_err(|e| Self::directory_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::directory_err(format!(
                "DELETE {url} returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

// ── In-memory implementation ──

/// Directory backend for tests and local dry runs.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<DirectoryState>,
}

#[derive(Default)]
struct DirectoryState {
    roster: Vec<String>,
    activities: HashMap<String, Vec<ActivityDef>>,
    completions: HashMap<String, Vec<Completion>>,
    addresses: HashMap<String, Address>,
    revoked: HashSet<String>,
    schedule_writes: usize,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_participant(&self, id: &str, activities: Vec<ActivityDef>) {
        let mut state = self.inner.lock().unwrap();
        state.roster.push(id.to_string());
        state.activities.insert(id.to_string(), activities);
    }

    pub fn set_address(&self, id: &str, address: Address) {
        self.inner
            .lock()
            .unwrap()
            .addresses
            .insert(id.to_string(), address);
    }

    pub fn record_completion(&self, participant: &str, activity_id: &str, at_ms: i64) {
        self.inner
            .lock()
            .unwrap()
            .completions
            .entry(participant.to_string())
            .or_default()
            .push(Completion {
                activity_id: activity_id.to_string(),
                at_ms,
            });
    }

    /// Current schedule of an activity, searched across all participants.
    pub fn schedule_of(&self, activity_id: &str) -> Option<Vec<ScheduleEntry>> {
        let state = self.inner.lock().unwrap();
        state
            .activities
            .values()
            .flatten()
            .find(|a| a.id == activity_id)
            .map(|a| a.schedule.clone())
    }

    pub fn schedule_write_count(&self) -> usize {
        self.inner.lock().unwrap().schedule_writes
    }

    pub fn sensors_revoked(&self, id: &str) -> bool {
        self.inner.lock().unwrap().revoked.contains(id)
    }
}

impl ActivityDirectory for MemoryDirectory {
    fn participants(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().roster.clone())
    }

    fn activities(&self, participant: &str) -> Result<Vec<ActivityDef>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .activities
            .get(participant)
            .cloned()
            .unwrap_or_default())
    }

    fn set_schedule(&self, activity_id: &str, entries: &[ScheduleEntry]) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.schedule_writes += 1;
        for defs in state.activities.values_mut() {
            if let Some(def) = defs.iter_mut().find(|a| a.id == activity_id) {
                def.schedule = entries.to_vec();
                return Ok(());
            }
        }
        Err(CoreError::gateway(
            "directory",
            format!("unknown activity id {activity_id}"),
        ))
    }

    fn completions(&self, participant: &str) -> Result<Vec<Completion>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .completions
            .get(participant)
            .cloned()
            .unwrap_or_default())
    }

    fn contact_address(&self, participant: &str) -> Result<Option<Address>> {
        Ok(self.inner.lock().unwrap().addresses.get(participant).cloned())
    }

    fn revoke_sensors(&self, participant: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .revoked
            .insert(participant.to_string());
        Ok(())
    }
}
