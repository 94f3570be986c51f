//! Webhook notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentCrashed,
    CommitsPushed,
    StaleLock,
    TestFailure,
    Test,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    pub project: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind, project: &str, message: impl Into<String>) -> Self {
        Self {
            event: kind,
            agent_id: None,
            agent_role: None,
            project: project.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            details: None,
        }
    }

    #[must_use]
    pub fn agent(mut self, id: u32, role: &str) -> Self {
        self.agent_id = Some(id);
        self.agent_role = Some(role.to_string());
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub const fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Delivers events somewhere. Implementations must be callable from any thread.
pub trait Notifier: Send + Sync {
    fn send(&self, event: &Event) -> anyhow::Result<()>;
}

/// Used when no webhook is configured.
#[derive(Debug, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// POSTs events as JSON to a fixed URL.
pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(WEBHOOK_TIMEOUT))
            .build()
            .into();
        Self {
            url: url.to_string(),
            agent,
        }
    }

    /// A webhook notifier for `url`, or a no-op one when `url` is blank.
    pub fn from_config(url: &str) -> Arc<dyn Notifier> {
        let url = url.trim();
        if url.is_empty() {
            Arc::new(NoopNotifier)
        } else {
            Arc::new(Self::new(url))
        }
    }
}

impl Notifier for WebhookNotifier {
    fn send(&self, event: &Event) -> anyhow::Result<()> {
        let body = serde_json::to_string(event).context("serializing event")?;
        // Non-2xx statuses surface as errors from ureq.
        self.agent
            .post(&self.url)
            .header("content-type", "application/json")
            .send(body)
            .with_context(|| format!("posting {:?} event to {}", event.event, self.url))?;
        debug!(event = ?event.event, url = %self.url, "webhook delivered");
        Ok(())
    }
}
