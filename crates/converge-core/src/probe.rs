//! Post-convergence diagnostic probes.
//!
//! Probes are independent checks run once the plan has converged. Each one
//! reports `pass`, `fail` or `skip`; a probe that cannot tell whether it
//! applies says `skip` rather than guessing. The suite runs probes
//! concurrently behind a semaphore and returns results sorted by name.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::ProbeSpec;
use crate::client::ProbeExecutor;
use crate::config::Settings;
use crate::events::{Event, EventKind, EventSink, TracingSink};
use crate::orchestrator::{ActionOutcome, ActionStatus};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Pass,
    Fail,
    Skip,
    /// Still running when the run was cancelled and the grace period ran out.
    Cancelled,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Pass => "pass",
            ProbeStatus::Fail => "fail",
            ProbeStatus::Skip => "skip",
            ProbeStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe executor reports for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeVerdict {
    pub status: ProbeStatus,
    pub detail: String,
}

impl ProbeVerdict {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Pass,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Fail,
            detail: detail.into(),
        }
    }

    pub fn skip(detail: impl Into<String>) -> Self {
        Self {
            status: ProbeStatus::Skip,
            detail: detail.into(),
        }
    }
}

/// A probe as declared in the plan file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawProbe")]
pub struct Probe {
    pub name: String,
    #[serde(flatten)]
    pub spec: ProbeSpec,
    #[serde(
        rename = "timeout_seconds",
        with = "crate::serde_secs",
        default = "default_probe_timeout"
    )]
    pub timeout: Duration,
    /// Actions that must have succeeded for this probe to be meaningful.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(60)
}

/// On-disk shape of a probe, with unknown keys rejected.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProbe {
    name: String,
    command: String,
    #[serde(
        rename = "timeout_seconds",
        with = "crate::serde_secs",
        default = "default_probe_timeout"
    )]
    timeout: Duration,
    #[serde(default)]
    requires: Vec<String>,
}

impl From<RawProbe> for Probe {
    fn from(raw: RawProbe) -> Self {
        Probe {
            name: raw.name,
            spec: ProbeSpec {
                command: raw.command,
            },
            timeout: raw.timeout,
            requires: raw.requires,
        }
    }
}

impl Probe {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec: ProbeSpec {
                command: command.into(),
            },
            timeout: default_probe_timeout(),
            requires: Vec::new(),
        }
    }

    pub fn requiring<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = actions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub status: ProbeStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub duration_ms: u64,
}

impl ProbeResult {
    fn new(name: &str, status: ProbeStatus, detail: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Every probe as `skip` with the same detail, sorted by name. Used when the
/// suite is not executed at all.
pub fn skip_all(probes: &[Probe], detail: &str) -> Vec<ProbeResult> {
    let mut results: Vec<ProbeResult> = probes
        .iter()
        .map(|p| ProbeResult::new(&p.name, ProbeStatus::Skip, detail, Duration::ZERO))
        .collect();
    results.sort_by(|a, b| a.name.cmp(&b.name));
    results
}

// ---------------------------------------------------------------------------
// ProbeSuite
// ---------------------------------------------------------------------------

pub struct ProbeSuite {
    executor: Arc<dyn ProbeExecutor>,
    settings: Arc<Settings>,
    events: Arc<dyn EventSink>,
}

impl ProbeSuite {
    pub fn new(executor: Arc<dyn ProbeExecutor>, settings: Arc<Settings>) -> Self {
        Self {
            executor,
            settings,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Run every probe and return one result per probe, sorted by name.
    ///
    /// When `actions` is given, a probe whose `requires` names an action that
    /// did not succeed is skipped without running. `deadline` caps every
    /// probe's own timeout. After `cancel` fires, queued probes are skipped
    /// and in-flight probes get `settings.probe_grace` to finish.
    pub async fn run(
        &self,
        probes: &[Probe],
        actions: Option<&[ActionOutcome]>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let statuses: Option<HashMap<&str, ActionStatus>> =
            actions.map(|a| a.iter().map(|o| (o.name.as_str(), o.status)).collect());

        let semaphore = Arc::new(Semaphore::new(self.settings.effective_probe_concurrency()));
        let mut results = Vec::with_capacity(probes.len());
        let mut handles = Vec::new();

        for probe in probes {
            if let Some(statuses) = &statuses {
                if let Some(detail) = unmet_requirement(probe, statuses) {
                    let result = ProbeResult::new(&probe.name, ProbeStatus::Skip, detail, Duration::ZERO);
                    self.emit(&result);
                    results.push(result);
                    continue;
                }
            }

            let sem = semaphore.clone();
            let executor = self.executor.clone();
            let settings = self.settings.clone();
            let cancel = cancel.clone();
            let probe = probe.clone();
            let name = probe.name.clone();
            let handle = tokio::spawn(async move {
                run_one(probe, executor, settings, sem, deadline, cancel).await
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => ProbeResult::new(
                    &name,
                    ProbeStatus::Fail,
                    format!("probe task failed: {e}"),
                    Duration::ZERO,
                ),
            };
            self.emit(&result);
            results.push(result);
        }

        results.sort_by(|a, b| a.name.cmp(&b.name));
        results
    }

    fn emit(&self, result: &ProbeResult) {
        self.events.emit(Event::new(
            &result.name,
            EventKind::ProbeFinished {
                status: result.status,
                detail: (!result.detail.is_empty()).then(|| result.detail.clone()),
            },
        ));
    }
}

fn unmet_requirement(probe: &Probe, statuses: &HashMap<&str, ActionStatus>) -> Option<String> {
    probe.requires.iter().find_map(|req| match statuses.get(req.as_str()) {
        Some(ActionStatus::Succeeded) => None,
        Some(status) => Some(format!("requires action '{req}', which did not succeed ({status})")),
        None => Some(format!("requires unknown action '{req}'")),
    })
}

async fn run_one(
    probe: Probe,
    executor: Arc<dyn ProbeExecutor>,
    settings: Arc<Settings>,
    semaphore: Arc<Semaphore>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
) -> ProbeResult {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return ProbeResult::new(
                &probe.name,
                ProbeStatus::Skip,
                "run cancelled before the probe started",
                Duration::ZERO,
            );
        }
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                return ProbeResult::new(&probe.name, ProbeStatus::Fail, "probe pool closed", Duration::ZERO);
            }
        },
    };

    let start = Instant::now();
    let own_limit = start + probe.timeout;
    let (limit, capped) = match deadline {
        Some(d) if d < own_limit => (d, true),
        _ => (own_limit, false),
    };

    let run = tokio::time::timeout_at(limit, executor.run_probe(&probe.spec, &settings));
    tokio::pin!(run);

    let finished = tokio::select! {
        biased;
        res = &mut run => Some(res),
        _ = cancel.cancelled() => {
            tracing::debug!(probe = %probe.name, grace_ms = settings.probe_grace.as_millis() as u64, "waiting for in-flight probe");
            tokio::time::timeout(settings.probe_grace, &mut run).await.ok()
        }
    };

    let (status, detail) = match finished {
        Some(Ok(Ok(verdict))) => (verdict.status, verdict.detail),
        Some(Ok(Err(e))) => (ProbeStatus::Fail, format!("probe could not run: {e:#}")),
        Some(Err(_)) if capped => (
            ProbeStatus::Fail,
            "run deadline reached before the probe finished".to_string(),
        ),
        Some(Err(_)) => (
            ProbeStatus::Fail,
            format!("timed out after {:.1}s", probe.timeout.as_secs_f64()),
        ),
        None => (
            ProbeStatus::Cancelled,
            "cancelled; did not finish within the grace period".to_string(),
        ),
    };
    ProbeResult::new(&probe.name, status, detail, start.elapsed())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
