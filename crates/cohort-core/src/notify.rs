//! Notification gateway and ops channel.
//!
//! Participant-facing notices go through the push gateway addressed by a
//! tagged address (device token or mailto). Ops alerts and cycle reports go
//! to a Slack-style webhook; with no webhook configured they degrade to log
//! lines. Gateway failures never abort a sweep.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ApiConfig;
use crate::error::{CoreError, Result};

/// Where a participant can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Address {
    Device { token: String },
    Mailto { email: String },
}

/// One participant-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub subject: String,
    pub body: String,
}

impl Notice {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Notice {
            subject: subject.into(),
            body: body.into(),
        }
    }
}

/// Delivery seam for participant notices.
pub trait NotificationGateway: Send + Sync {
    fn send(&self, address: &Address, notice: &Notice) -> Result<()>;
}

// ── HTTP push gateway ──

pub struct PushGateway {
    base_url: String,
    access_key: String,
    http_client: Client,
}

impl PushGateway {
    pub fn new(api: &ApiConfig) -> Result<Self> {
        Ok(Self {
            base_url: api.validated_base_url()?,
            access_key: api.access_key.clone(),
            http_client: Client::new(),
        })
    }
}

impl NotificationGateway for PushGateway {
    fn send(&self, address: &Address, notice: &Notice) -> Result<()> {
        let body = json!({
            "address": address,
            "subject": notice.subject,
            "body": notice.body,
        });
        let url = format!("{}/notification", self.base_url);
        let resp = tokio::runtime::Handle::current()
            .block_on(
                self.http_client
                    .post(&url)
                    .bearer_auth(&self.access_key)
                    .json(&body)
                    .send(),
            )
            .map_err(|e| CoreError::gateway("push", e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CoreError::gateway(
                "push",
                format!("POST {url} returned HTTP {}", resp.status()),
            ));
        }
        Ok(())
    }
}

// ── Ops channel ──

/// Webhook for alerts and cycle reports. Send failures are logged, not
/// propagated; losing an alert must not lose the sweep.
pub struct OpsChannel {
    webhook_url: Option<String>,
    http_client: Client,
    alerts: AtomicUsize,
}

impl OpsChannel {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            http_client: Client::new(),
            alerts: AtomicUsize::new(0),
        }
    }

    pub fn alert(&self, text: &str) {
        self.alerts.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("ops alert: {text}");
        self.post(text);
    }

    /// Alerts raised since construction. The cycle report quotes this.
    pub fn alert_count(&self) -> usize {
        self.alerts.load(Ordering::Relaxed)
    }

    pub fn report(&self, text: &str) {
        tracing::info!("ops report: {text}");
        self.post(text);
    }

    fn post(&self, text: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let result = tokio::runtime::Handle::current().block_on(
            self.http_client
                .post(url)
                .header("Content-Type", "application/json")
                .json(&json!({ "text": text }))
                .send(),
        );
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::error!("ops webhook returned HTTP {}", resp.status());
            }
            Err(e) => tracing::error!("ops webhook failed: {e}"),
            _ => {}
        }
    }
}

// ── In-memory gateway ──

/// Captures notices instead of delivering them.
#[derive(Default)]
pub struct MemoryGateway {
    sent: Mutex<Vec<(Address, Notice)>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Address, Notice)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn subjects_sent(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, n)| n.subject.clone())
            .collect()
    }
}

impl NotificationGateway for MemoryGateway {
    fn send(&self, address: &Address, notice: &Notice) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((address.clone(), notice.clone()));
        Ok(())
    }
}
