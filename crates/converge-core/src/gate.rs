//! Readiness gates: bounded, cancellable polling of a resource's state.
//!
//! A gate is bound to one install-class action. After the action's operation
//! succeeds the orchestrator polls the gate's target until it reports ready,
//! the gate times out, or the run is cancelled.
//!
//! ## Timing
//!
//! Evaluations start at `t = 0, I, 2I, ...` measured from the first poll, and
//! no evaluation starts at or after the deadline. With timeout `T` and
//! interval `I` that is at most `ceil(T / I)` evaluations, and the gate gives
//! up at `T` (plus the tail of an evaluation already in flight, which is
//! itself bounded by the deadline).

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::ResourceStatus;

// ---------------------------------------------------------------------------
// GateSpec
// ---------------------------------------------------------------------------

/// The resource a gate inspects. `check` is handed to the cluster client;
/// `resource` is a display label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub check: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub check: String,
    #[serde(
        rename = "poll_interval_seconds",
        with = "crate::serde_secs",
        default = "default_poll_interval"
    )]
    pub poll_interval: Duration,
    /// Overall gate timeout. Defaults to the owning action's timeout.
    #[serde(
        rename = "timeout_seconds",
        with = "crate::serde_secs::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl GateSpec {
    pub fn new(check: impl Into<String>) -> Self {
        Self {
            resource: None,
            check: check.into(),
            poll_interval: default_poll_interval(),
            timeout: None,
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn within(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target(&self) -> ResourceRef {
        ResourceRef {
            resource: self.resource.clone(),
            check: self.check.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// GateStatus / GateOutcome
// ---------------------------------------------------------------------------

/// Result of a single evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum GateStatus {
    Ready,
    NotReady(String),
    /// The check itself could not be evaluated.
    Error(String),
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Ready => "ready",
            GateStatus::NotReady(_) => "not_ready",
            GateStatus::Error(_) => "error",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            GateStatus::Ready => None,
            GateStatus::NotReady(d) | GateStatus::Error(d) => Some(d),
        }
    }
}

/// Terminal result of a polling loop.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Ready {
        polls: u32,
    },
    TimedOut {
        polls: u32,
        waited: Duration,
        last_not_ready: Option<String>,
        last_error: Option<String>,
    },
    Cancelled {
        polls: u32,
    },
}

impl GateOutcome {
    pub fn polls(&self) -> u32 {
        match self {
            GateOutcome::Ready { polls }
            | GateOutcome::TimedOut { polls, .. }
            | GateOutcome::Cancelled { polls } => *polls,
        }
    }

    /// Failure text for a timed-out gate, preferring the last error detail.
    pub fn timeout_detail(&self) -> Option<String> {
        let GateOutcome::TimedOut {
            polls,
            waited,
            last_not_ready,
            last_error,
        } = self
        else {
            return None;
        };
        let mut msg = format!(
            "not ready after {polls} poll(s) in {:.1}s",
            waited.as_secs_f64()
        );
        if let Some(err) = last_error {
            msg.push_str(&format!("; last error: {err}"));
        }
        if let Some(detail) = last_not_ready.as_deref().filter(|d| !d.is_empty()) {
            msg.push_str(&format!("; last status: {detail}"));
        }
        Some(msg)
    }
}

// ---------------------------------------------------------------------------
// ReadinessGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ReadinessGate {
    interval: Duration,
    timeout: Duration,
}

impl ReadinessGate {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Build the gate for `spec`, falling back to `action_timeout` when the
    /// spec has no timeout of its own.
    pub fn from_spec(spec: &GateSpec, action_timeout: Duration) -> Self {
        Self::new(spec.poll_interval, spec.timeout.unwrap_or(action_timeout))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll `evaluate` until ready, timeout, or cancellation.
    ///
    /// `ceiling` caps the gate's own timeout (the run deadline). `on_poll`
    /// sees every evaluation result, in order, with its 1-indexed number.
    pub async fn poll<F, Fut, P>(
        &self,
        mut evaluate: F,
        ceiling: Option<Instant>,
        cancel: &CancellationToken,
        mut on_poll: P,
    ) -> GateOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<ResourceStatus>>,
        P: FnMut(u32, &GateStatus),
    {
        let start = Instant::now();
        let deadline = match ceiling {
            Some(c) => (start + self.timeout).min(c),
            None => start + self.timeout,
        };
        let mut polls = 0u32;
        let mut last_not_ready = None;
        let mut last_error = None;

        let timed_out = |polls: u32, last_not_ready: Option<String>, last_error: Option<String>| {
            GateOutcome::TimedOut {
                polls,
                waited: start.elapsed(),
                last_not_ready,
                last_error,
            }
        };

        loop {
            if cancel.is_cancelled() {
                return GateOutcome::Cancelled { polls };
            }
            if Instant::now() >= deadline {
                return timed_out(polls, last_not_ready, last_error);
            }

            polls += 1;
            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => return GateOutcome::Cancelled { polls },
                res = tokio::time::timeout_at(deadline, evaluate()) => match res {
                    Ok(Ok(ResourceStatus::Ready)) => GateStatus::Ready,
                    Ok(Ok(ResourceStatus::NotReady(detail))) => GateStatus::NotReady(detail),
                    Ok(Err(e)) => GateStatus::Error(format!("{e:#}")),
                    Err(_) => GateStatus::Error("check did not finish before the gate deadline".to_string()),
                },
            };
            on_poll(polls, &status);

            match status {
                GateStatus::Ready => return GateOutcome::Ready { polls },
                GateStatus::NotReady(detail) => last_not_ready = Some(detail),
                GateStatus::Error(err) => last_error = Some(err),
            }

            let next = start + self.interval * polls;
            if next >= deadline {
                // No evaluation may start at or past the deadline: wait it out.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return GateOutcome::Cancelled { polls },
                    _ = tokio::time::sleep_until(deadline) => {
                        return timed_out(polls, last_not_ready, last_error);
                    }
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return GateOutcome::Cancelled { polls },
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
