//! Structured per-step events emitted while a run progresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::action::ActionKind;
use crate::orchestrator::ActionStatus;
use crate::probe::ProbeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Action or probe the event concerns.
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    ActionStarted {
        kind: ActionKind,
    },
    AttemptStarted {
        attempt: u32,
    },
    AttemptFailed {
        attempt: u32,
        error: String,
    },
    BackoffScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    GatePolled {
        poll: u32,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Readiness read before re-invoking a non-idempotent operation.
    CompensatingCheck {
        ready: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ActionFinished {
        status: ActionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ProbeFinished {
        status: ProbeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

// ---------------------------------------------------------------------------
// TracingSink
// ---------------------------------------------------------------------------

/// Default sink: every event becomes a `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let name = event.name.as_str();
        match &event.kind {
            EventKind::ActionStarted { kind } => {
                tracing::info!(action = name, kind = %kind, "action started");
            }
            EventKind::AttemptStarted { attempt } => {
                tracing::debug!(action = name, attempt, "attempt started");
            }
            EventKind::AttemptFailed { attempt, error } => {
                tracing::warn!(action = name, attempt, error = %error, "attempt failed");
            }
            EventKind::BackoffScheduled { attempt, delay_ms } => {
                tracing::info!(action = name, attempt, delay_ms, "retrying after backoff");
            }
            EventKind::GatePolled {
                poll,
                status,
                detail,
            } => {
                tracing::debug!(
                    action = name,
                    poll,
                    status = %status,
                    detail = detail.as_deref().unwrap_or(""),
                    "gate polled"
                );
            }
            EventKind::CompensatingCheck { ready, detail } => {
                tracing::info!(
                    action = name,
                    ready,
                    detail = detail.as_deref().unwrap_or(""),
                    "checked target before retry"
                );
            }
            EventKind::ActionFinished { status, detail } => {
                let detail = detail.as_deref().unwrap_or("");
                match status {
                    ActionStatus::Failed => {
                        tracing::error!(action = name, status = %status, detail, "action finished")
                    }
                    ActionStatus::Skipped | ActionStatus::Cancelled => {
                        tracing::warn!(action = name, status = %status, detail, "action finished")
                    }
                    _ => tracing::info!(action = name, status = %status, detail, "action finished"),
                }
            }
            EventKind::ProbeFinished { status, detail } => {
                let detail = detail.as_deref().unwrap_or("");
                match status {
                    ProbeStatus::Fail => {
                        tracing::warn!(probe = name, status = %status, detail, "probe finished")
                    }
                    _ => tracing::info!(probe = name, status = %status, detail, "probe finished"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// Keeps every event in memory, optionally forwarding to another sink.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    forward: Option<Arc<dyn EventSink>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarding(inner: Arc<dyn EventSink>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            forward: Some(inner),
        }
    }

    /// Snapshot of everything recorded so far, in emission order.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Recorded events for one action or probe.
    pub fn events_for(&self, name: &str) -> Vec<EventKind> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .map(|e| e.kind)
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        if let Some(inner) = &self.forward {
            inner.emit(event.clone());
        }
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
