//! Plan execution.
//!
//! The orchestrator walks a `DependencyPlan` in topological order on a single
//! logical thread. Each action's operation is invoked (with retry), then its
//! readiness gate, if any, is polled. A failed action skips its dependents
//! transitively while independent branches carry on. Once every action is
//! settled the probe suite runs, unless a required action failed or the run
//! was cancelled, and the results are folded into a `Report`.
//!
//! ## Failure semantics
//!
//! | step                   | outcome                          | retried? |
//! |------------------------|----------------------------------|----------|
//! | operation error        | `FailureKind::Execution`         | yes      |
//! | operation timeout      | `FailureKind::Execution`         | yes      |
//! | gate timeout           | `FailureKind::GateTimeout`       | no       |
//! | cancellation           | `ActionStatus::Cancelled`        | no       |
//!
//! Non-idempotent actions read their gate target once before each retry. If
//! the target is already ready the earlier attempt is taken to have applied
//! and the operation is not invoked again.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::action::{Action, ActionKind, Operation};
use crate::client::{ClusterClient, ProbeExecutor, ResourceStatus};
use crate::config::Settings;
use crate::events::{Event, EventKind, EventSink, TracingSink};
use crate::gate::{GateOutcome, GateSpec, GateStatus, ReadinessGate};
use crate::plan::DependencyPlan;
use crate::probe::{self, Probe, ProbeStatus, ProbeSuite};
use crate::report::{Report, ResultAggregator};
use crate::retry::{sleep_or_cancel, RetryPolicy};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Running => "running",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
            ActionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the run stopped before reaching an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    Cancelled,
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// `action` is the failed ancestor, not necessarily a direct dependency.
    UpstreamFailed { action: String },
    UpstreamSkipped { action: String },
    /// A probe-kind action reported that it does not apply.
    NotApplicable,
    RunStopped { cause: StopCause },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Execution,
    GateTimeout,
}

/// Execution record for one action in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub name: String,
    pub kind: ActionKind,
    pub optional: bool,
    pub status: ActionStatus,
    /// Operation invocations made, including the first.
    pub attempts: u32,
    pub gate_polls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

impl ActionOutcome {
    pub fn pending(name: impl Into<String>, kind: ActionKind, optional: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            optional,
            status: ActionStatus::Pending,
            attempts: 0,
            gate_polls: 0,
            skip_reason: None,
            failure: None,
            detail: None,
            duration_ms: 0,
        }
    }

    /// True when this outcome alone makes the run fail: a required action
    /// that failed, was skipped because something upstream failed, or was
    /// never reached before the run deadline.
    pub fn blocks_run(&self) -> bool {
        if self.optional {
            return false;
        }
        match self.status {
            ActionStatus::Failed => true,
            ActionStatus::Skipped => matches!(
                self.skip_reason,
                Some(SkipReason::UpstreamFailed { .. })
                    | Some(SkipReason::RunStopped {
                        cause: StopCause::Deadline
                    })
            ),
            _ => false,
        }
    }

    fn skip(&mut self, reason: SkipReason, detail: String) {
        self.status = ActionStatus::Skipped;
        self.skip_reason = Some(reason);
        self.detail = Some(detail);
    }
}

/// Result of executing the actions of a plan, before probes.
#[derive(Debug, Clone)]
pub struct PlanRun {
    /// In execution order.
    pub outcomes: Vec<ActionOutcome>,
    pub cancelled: bool,
    pub deadline_exceeded: bool,
}

// ---------------------------------------------------------------------------
// Internal step results
// ---------------------------------------------------------------------------

enum Invocation {
    Done(Option<String>),
    NotApplicable(String),
    Failed(String),
    Cancelled,
}

enum Step {
    /// Operation succeeded; the gate (if any) still has to pass.
    Applied(Option<String>),
    /// A compensating check found the target ready; no gate needed.
    AlreadyReady,
    NotApplicable(String),
    Failed(String),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    client: Arc<dyn ClusterClient>,
    probes: Arc<dyn ProbeExecutor>,
    settings: Arc<Settings>,
    events: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        probes: Arc<dyn ProbeExecutor>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            client,
            probes,
            settings,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    fn suite(&self) -> ProbeSuite {
        ProbeSuite::new(self.probes.clone(), self.settings.clone()).with_events(self.events.clone())
    }

    fn emit(&self, name: &str, kind: EventKind) {
        self.events.emit(Event::new(name, kind));
    }

    /// Execute the plan, then the probe suite, and report.
    pub async fn run(
        &self,
        plan: &DependencyPlan,
        probes: &[Probe],
        cancel: &CancellationToken,
    ) -> Report {
        let aggregator = ResultAggregator::new();
        let deadline = self.settings.deadline.map(|d| Instant::now() + d);
        tracing::info!(actions = plan.len(), probes = probes.len(), "starting run");

        let run = self.execute_plan(plan, cancel, deadline).await;

        let blocking: Vec<&str> = run
            .outcomes
            .iter()
            .filter(|o| o.blocks_run())
            .map(|o| o.name.as_str())
            .collect();
        let (probe_results, executed) = if run.cancelled || cancel.is_cancelled() {
            (probe::skip_all(probes, "run cancelled before probes started"), false)
        } else if !blocking.is_empty() {
            let detail = format!(
                "not run: required action(s) did not succeed: {}",
                blocking.join(", ")
            );
            tracing::warn!(failed = %blocking.join(", "), "skipping probe suite");
            (probe::skip_all(probes, &detail), false)
        } else {
            let results = self
                .suite()
                .run(probes, Some(&run.outcomes), deadline, cancel)
                .await;
            (results, true)
        };

        let report = aggregator
            .cancelled(run.cancelled || cancel.is_cancelled())
            .deadline_exceeded(run.deadline_exceeded)
            .probes_executed(executed)
            .aggregate(run.outcomes, probe_results);
        tracing::info!(status = %report.overall_status, exit_code = report.exit_code, "run finished");
        report
    }

    /// Run only the probe suite. Probe `requires` lists are not evaluated.
    pub async fn run_probes_only(&self, probes: &[Probe], cancel: &CancellationToken) -> Report {
        let aggregator = ResultAggregator::new();
        let deadline = self.settings.deadline.map(|d| Instant::now() + d);
        tracing::info!(probes = probes.len(), "running probes only");
        let results = self.suite().run(probes, None, deadline, cancel).await;
        let deadline_exceeded = deadline.is_some_and(|d| Instant::now() >= d);
        aggregator
            .cancelled(cancel.is_cancelled())
            .deadline_exceeded(deadline_exceeded)
            .probes_executed(true)
            .aggregate(Vec::new(), results)
    }

    /// Execute every action in plan order. Returns outcomes in that order.
    pub async fn execute_plan(
        &self,
        plan: &DependencyPlan,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> PlanRun {
        let actions = plan.actions();
        let mut outcomes: Vec<ActionOutcome> = actions
            .iter()
            .map(|a| ActionOutcome::pending(&a.name, a.kind(), a.optional))
            .collect();
        let mut stop: Option<StopCause> = None;

        for &i in plan.order_indices() {
            let action = &actions[i];

            if stop.is_none() {
                if cancel.is_cancelled() {
                    stop = Some(StopCause::Cancelled);
                } else if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::warn!(action = %action.name, "run deadline reached");
                    stop = Some(StopCause::Deadline);
                }
            }

            if let Some(cause) = stop {
                let detail = match cause {
                    StopCause::Cancelled => "not started: run cancelled",
                    StopCause::Deadline => "not started: run deadline reached",
                };
                outcomes[i].skip(SkipReason::RunStopped { cause }, detail.to_string());
                self.finish(&outcomes[i]);
                continue;
            }

            if let Some((reason, detail)) = upstream_skip(plan.dependencies(i), actions, &outcomes) {
                outcomes[i].skip(reason, detail);
                self.finish(&outcomes[i]);
                continue;
            }

            outcomes[i] = self.execute_action(action, cancel, deadline).await;
            if outcomes[i].status == ActionStatus::Cancelled {
                stop = Some(StopCause::Cancelled);
            }
        }

        let deadline_exceeded = stop == Some(StopCause::Deadline)
            || deadline.is_some_and(|d| Instant::now() >= d);
        let ordered = plan
            .order_indices()
            .iter()
            .map(|&i| outcomes[i].clone())
            .collect();
        PlanRun {
            outcomes: ordered,
            cancelled: stop == Some(StopCause::Cancelled),
            deadline_exceeded,
        }
    }

    fn finish(&self, outcome: &ActionOutcome) {
        self.emit(
            &outcome.name,
            EventKind::ActionFinished {
                status: outcome.status,
                detail: outcome.detail.clone(),
            },
        );
    }

    // -----------------------------------------------------------------------
    // Single action
    // -----------------------------------------------------------------------

    async fn execute_action(
        &self,
        action: &Action,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ActionOutcome {
        let started = Instant::now();
        let mut outcome = ActionOutcome::pending(&action.name, action.kind(), action.optional);
        outcome.status = ActionStatus::Running;
        self.emit(&action.name, EventKind::ActionStarted { kind: action.kind() });

        let step = self.invoke_with_retry(action, &mut outcome, cancel, deadline).await;

        match step {
            Step::Applied(detail) => match &action.gate {
                Some(gate) => {
                    let gated = self.await_gate(action, gate, cancel, deadline).await;
                    outcome.gate_polls = gated.polls();
                    match gated {
                        GateOutcome::Ready { .. } => {
                            outcome.status = ActionStatus::Succeeded;
                            outcome.detail = detail;
                        }
                        GateOutcome::TimedOut { .. } => {
                            outcome.status = ActionStatus::Failed;
                            outcome.failure = Some(FailureKind::GateTimeout);
                            outcome.detail = gated.timeout_detail();
                        }
                        GateOutcome::Cancelled { .. } => {
                            outcome.status = ActionStatus::Cancelled;
                            outcome.detail = Some("cancelled while waiting for readiness".into());
                        }
                    }
                }
                None => {
                    outcome.status = ActionStatus::Succeeded;
                    outcome.detail = detail;
                }
            },
            Step::AlreadyReady => {
                outcome.status = ActionStatus::Succeeded;
                outcome.detail = Some("target already ready; earlier attempt took effect".into());
            }
            Step::NotApplicable(detail) => {
                outcome.skip(SkipReason::NotApplicable, detail);
            }
            Step::Failed(detail) => {
                outcome.status = ActionStatus::Failed;
                outcome.failure = Some(FailureKind::Execution);
                outcome.detail = Some(detail);
            }
            Step::Cancelled => {
                outcome.status = ActionStatus::Cancelled;
                outcome.detail = Some("cancelled during execution".into());
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        self.finish(&outcome);
        outcome
    }

    async fn invoke_with_retry(
        &self,
        action: &Action,
        outcome: &mut ActionOutcome,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Step {
        let policy = action.retry.clone().unwrap_or_else(RetryPolicy::none);
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if attempt > 1 && !action.idempotent {
                if let Some(gate) = &action.gate {
                    match self.compensating_check(action, gate, cancel, deadline).await {
                        Some(true) => return Step::AlreadyReady,
                        Some(false) => {}
                        None => return Step::Cancelled,
                    }
                }
            }

            outcome.attempts = attempt;
            self.emit(&action.name, EventKind::AttemptStarted { attempt });

            let err = match self.invoke(action, cancel, deadline).await {
                Invocation::Done(detail) => return Step::Applied(detail),
                Invocation::NotApplicable(detail) => return Step::NotApplicable(detail),
                Invocation::Cancelled => return Step::Cancelled,
                Invocation::Failed(err) => err,
            };
            self.emit(
                &action.name,
                EventKind::AttemptFailed {
                    attempt,
                    error: err.clone(),
                },
            );

            if attempt >= max_attempts {
                return Step::Failed(if max_attempts > 1 {
                    format!("failed after {attempt} attempts: {err}")
                } else {
                    err
                });
            }

            let delay = policy.delay_for(attempt);
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                return Step::Failed(format!("{err} (run deadline leaves no time to retry)"));
            }
            self.emit(
                &action.name,
                EventKind::BackoffScheduled {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                },
            );
            if !sleep_or_cancel(delay, cancel).await {
                return Step::Cancelled;
            }
        }
    }

    /// One invocation of the action's operation, bounded by the action
    /// timeout and the run deadline.
    async fn invoke(
        &self,
        action: &Action,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Invocation {
        let (limit, capped) = bounded(Instant::now() + action.timeout, deadline);
        let settings = self.settings.as_ref();

        let op = async {
            match &action.operation {
                Operation::Install(spec) => self.client.install(spec, settings).await.map(|_| None),
                Operation::ApplyManifest(manifest) => self
                    .client
                    .apply_manifest(manifest, settings)
                    .await
                    .map(|_| None),
                Operation::Probe(spec) => self.probes.run_probe(spec, settings).await.map(Some),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Invocation::Cancelled,
            res = tokio::time::timeout_at(limit, op) => match res {
                Ok(Ok(None)) => Invocation::Done(None),
                Ok(Ok(Some(verdict))) => match verdict.status {
                    ProbeStatus::Pass => {
                        Invocation::Done((!verdict.detail.is_empty()).then_some(verdict.detail))
                    }
                    ProbeStatus::Skip => Invocation::NotApplicable(verdict.detail),
                    ProbeStatus::Fail | ProbeStatus::Cancelled => Invocation::Failed(if verdict.detail.is_empty() {
                        "probe failed".to_string()
                    } else {
                        verdict.detail
                    }),
                },
                Ok(Err(e)) => Invocation::Failed(format!("{e:#}")),
                Err(_) if capped => Invocation::Failed("run deadline reached during the operation".into()),
                Err(_) => Invocation::Failed(format!(
                    "operation timed out after {:.1}s",
                    action.timeout.as_secs_f64()
                )),
            },
        }
    }

    async fn await_gate(
        &self,
        action: &Action,
        gate: &GateSpec,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> GateOutcome {
        let readiness = ReadinessGate::from_spec(gate, action.timeout);
        let target = gate.target();
        let settings = self.settings.as_ref();
        tracing::debug!(
            action = %action.name,
            interval_ms = readiness.interval().as_millis() as u64,
            timeout_ms = readiness.timeout().as_millis() as u64,
            "waiting for readiness"
        );
        readiness
            .poll(
                || self.client.get_status(&target, settings),
                deadline,
                cancel,
                |poll, status: &GateStatus| {
                    self.emit(
                        &action.name,
                        EventKind::GatePolled {
                            poll,
                            status: status.as_str().to_string(),
                            detail: status.detail().map(str::to_string),
                        },
                    );
                },
            )
            .await
    }

    /// Read the gate target once. `None` means the run was cancelled.
    async fn compensating_check(
        &self,
        action: &Action,
        gate: &GateSpec,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Option<bool> {
        let (limit, _) = bounded(Instant::now() + action.timeout, deadline);
        let target = gate.target();
        let (ready, detail) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            res = tokio::time::timeout_at(limit, self.client.get_status(&target, &self.settings)) => match res {
                Ok(Ok(ResourceStatus::Ready)) => (true, None),
                Ok(Ok(ResourceStatus::NotReady(detail))) => (false, Some(detail)),
                Ok(Err(e)) => (false, Some(format!("{e:#}"))),
                Err(_) => (false, Some("check timed out".to_string())),
            },
        };
        self.emit(&action.name, EventKind::CompensatingCheck { ready, detail });
        Some(ready)
    }
}

/// Cap `limit` at the run deadline. The flag is true when the deadline is
/// the binding constraint.
fn bounded(limit: Instant, deadline: Option<Instant>) -> (Instant, bool) {
    match deadline {
        Some(d) if d < limit => (d, true),
        _ => (limit, false),
    }
}

/// Decide whether an action must be skipped because of its dependencies.
/// An upstream failure takes precedence over an upstream skip.
fn upstream_skip(
    deps: &[usize],
    actions: &[Action],
    outcomes: &[ActionOutcome],
) -> Option<(SkipReason, String)> {
    let mut skipped = None;
    for &d in deps {
        let dep = &outcomes[d];
        let dep_name = &actions[d].name;
        match (dep.status, &dep.skip_reason) {
            (ActionStatus::Failed, _) => {
                return Some((
                    SkipReason::UpstreamFailed {
                        action: dep_name.clone(),
                    },
                    format!("dependency '{dep_name}' failed"),
                ));
            }
            (ActionStatus::Skipped, Some(SkipReason::UpstreamFailed { action })) => {
                return Some((
                    SkipReason::UpstreamFailed {
                        action: action.clone(),
                    },
                    format!("dependency '{dep_name}' was skipped: upstream action '{action}' failed"),
                ));
            }
            (ActionStatus::Succeeded, _) => {}
            _ => {
                skipped.get_or_insert_with(|| {
                    (
                        SkipReason::UpstreamSkipped {
                            action: dep_name.clone(),
                        },
                        format!("dependency '{dep_name}' did not run ({})", dep.status),
                    )
                });
            }
        }
    }
    skipped
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ComponentSpec, ManifestRef, ProbeSpec};
    use crate::events::RecordingSink;
    use crate::gate::ResourceRef;
    use crate::probe::ProbeVerdict;
    use crate::report::OverallStatus;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone)]
    enum Op {
        Ok,
        Err(&'static str),
        Hang,
    }

    type Scripts<T> = Mutex<HashMap<String, VecDeque<T>>>;

    /// In-memory cluster. Every key replays its script in order and then
    /// keeps repeating the last entry. Unscripted keys succeed.
    #[derive(Default)]
    struct FakeCluster {
        ops: Scripts<Op>,
        statuses: Scripts<Result<ResourceStatus, &'static str>>,
        verdicts: Scripts<ProbeVerdict>,
        calls: Mutex<Vec<String>>,
    }

    fn next<T: Clone>(scripts: &Scripts<T>, key: &str) -> Option<T> {
        let mut scripts = scripts.lock().unwrap();
        let queue = scripts.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }

    impl FakeCluster {
        fn op(self, key: &str, script: impl IntoIterator<Item = Op>) -> Self {
            self.ops.lock().unwrap().insert(key.into(), script.into_iter().collect());
            self
        }

        fn status(
            self,
            check: &str,
            script: impl IntoIterator<Item = Result<ResourceStatus, &'static str>>,
        ) -> Self {
            self.statuses
                .lock()
                .unwrap()
                .insert(check.into(), script.into_iter().collect());
            self
        }

        fn verdict(self, command: &str, script: impl IntoIterator<Item = ProbeVerdict>) -> Self {
            self.verdicts
                .lock()
                .unwrap()
                .insert(command.into(), script.into_iter().collect());
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        async fn perform(&self, key: String) -> anyhow::Result<()> {
            let op = next(&self.ops, &key).unwrap_or(Op::Ok);
            self.record(key);
            match op {
                Op::Ok => Ok(()),
                Op::Err(e) => Err(anyhow::anyhow!(e)),
                Op::Hang => {
                    tokio::time::sleep(Duration::from_secs(86_400)).await;
                    Ok(())
                }
            }
        }
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn install(&self, component: &ComponentSpec, _: &Settings) -> anyhow::Result<()> {
            self.perform(format!("install:{}", component.command)).await
        }

        async fn apply_manifest(&self, manifest: &ManifestRef, _: &Settings) -> anyhow::Result<()> {
            self.perform(format!("apply:{}", manifest.manifest.display())).await
        }

        async fn get_status(&self, resource: &ResourceRef, _: &Settings) -> anyhow::Result<ResourceStatus> {
            self.record(format!("status:{}", resource.check));
            next(&self.statuses, &resource.check)
                .unwrap_or(Ok(ResourceStatus::Ready))
                .map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[async_trait]
    impl ProbeExecutor for FakeCluster {
        async fn run_probe(&self, probe: &ProbeSpec, _: &Settings) -> anyhow::Result<ProbeVerdict> {
            self.record(format!("probe:{}", probe.command));
            Ok(next(&self.verdicts, &probe.command).unwrap_or_else(|| ProbeVerdict::pass("")))
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn setup(cluster: FakeCluster, settings: Settings) -> (Orchestrator, Arc<FakeCluster>, Arc<RecordingSink>) {
        let cluster = Arc::new(cluster);
        let sink = Arc::new(RecordingSink::new());
        let orch = Orchestrator::new(cluster.clone(), cluster.clone(), Arc::new(settings))
            .with_events(sink.clone());
        (orch, cluster, sink)
    }

    fn install(name: &str) -> Action {
        Action::install(name, name)
    }

    fn gate(check: &str, timeout_secs: u64) -> GateSpec {
        GateSpec::new(check)
            .every(Duration::from_secs(1))
            .within(Duration::from_secs(timeout_secs))
    }

    fn retry(attempts: u32, initial_secs: u64) -> RetryPolicy {
        RetryPolicy::with_max_attempts(attempts).backoff(
            Duration::from_secs(initial_secs),
            2.0,
            Duration::from_secs(30),
        )
    }

    fn plan(actions: Vec<Action>) -> DependencyPlan {
        DependencyPlan::new(actions).unwrap()
    }

    fn outcome<'a>(report: &'a Report, name: &str) -> &'a ActionOutcome {
        report
            .plan_results
            .iter()
            .find(|o| o.name == name)
            .unwrap_or_else(|| panic!("no outcome for {name}"))
    }

    fn not_ready(detail: &'static str) -> Result<ResourceStatus, &'static str> {
        Ok(ResourceStatus::NotReady(detail.to_string()))
    }

    fn cancel_after(ms: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            trigger.cancel();
        });
        cancel
    }

    // -----------------------------------------------------------------------
    // Ordering and propagation
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn runs_actions_in_dependency_order() {
        let (orch, cluster, _) = setup(FakeCluster::default(), Settings::default());
        let plan = plan(vec![
            install("c").depends_on(["b"]),
            install("b").depends_on(["a"]),
            install("a"),
        ]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        assert_eq!(cluster.calls(), vec!["install:a", "install:b", "install:c"]);
        let names: Vec<&str> = report.plan_results.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(report
            .plan_results
            .iter()
            .all(|o| o.status == ActionStatus::Succeeded && o.attempts == 1));
        assert_eq!(report.overall_status, OverallStatus::Succeeded);
        assert_eq!(report.exit_code, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_manifest_goes_through_client() {
        let (orch, cluster, _) = setup(FakeCluster::default(), Settings::default());
        let plan = plan(vec![Action::apply_manifest("namespaces", "manifests/ns.yaml")]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;
        assert_eq!(cluster.calls(), vec!["apply:manifests/ns.yaml"]);
        assert_eq!(outcome(&report, "namespaces").kind, ActionKind::ApplyManifest);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_skips_dependents_transitively() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("chart not found")]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![
            install("a"),
            install("b").depends_on(["a"]),
            install("c").depends_on(["b"]),
            install("d"),
        ]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.failure, Some(FailureKind::Execution));
        assert_eq!(a.detail.as_deref(), Some("chart not found"));
        for name in ["b", "c"] {
            let o = outcome(&report, name);
            assert_eq!(o.status, ActionStatus::Skipped);
            assert_eq!(o.attempts, 0);
            assert_eq!(
                o.skip_reason,
                Some(SkipReason::UpstreamFailed { action: "a".into() })
            );
        }
        assert_eq!(outcome(&report, "d").status, ActionStatus::Succeeded);
        assert_eq!(cluster.calls(), vec!["install:a", "install:d"]);
        assert_eq!(report.overall_status, OverallStatus::Failed);
        assert_eq!(report.exit_code, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_action_skip_cascades_as_upstream_skipped() {
        let cluster = FakeCluster::default().verdict("has-gpu", [ProbeVerdict::skip("no GPU nodes")]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![
            Action::probe("gpu-check", "has-gpu"),
            install("gpu-operator").depends_on(["gpu-check"]),
        ]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let check = outcome(&report, "gpu-check");
        assert_eq!(check.status, ActionStatus::Skipped);
        assert_eq!(check.skip_reason, Some(SkipReason::NotApplicable));
        assert_eq!(check.detail.as_deref(), Some("no GPU nodes"));
        assert_eq!(
            outcome(&report, "gpu-operator").skip_reason,
            Some(SkipReason::UpstreamSkipped {
                action: "gpu-check".into()
            })
        );
        assert_eq!(cluster.calls(), vec!["probe:has-gpu"]);
        assert_eq!(report.overall_status, OverallStatus::Succeeded);
    }

    // -----------------------------------------------------------------------
    // Retry
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("flaky"), Op::Err("flaky"), Op::Ok]);
        let (orch, _, sink) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a").with_retry(retry(3, 1))]);
        let started = Instant::now();
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Succeeded);
        assert_eq!(a.attempts, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(
            sink.events_for("a"),
            vec![
                EventKind::ActionStarted { kind: ActionKind::Install },
                EventKind::AttemptStarted { attempt: 1 },
                EventKind::AttemptFailed { attempt: 1, error: "flaky".into() },
                EventKind::BackoffScheduled { attempt: 1, delay_ms: 1000 },
                EventKind::AttemptStarted { attempt: 2 },
                EventKind::AttemptFailed { attempt: 2, error: "flaky".into() },
                EventKind::BackoffScheduled { attempt: 2, delay_ms: 2000 },
                EventKind::AttemptStarted { attempt: 3 },
                EventKind::ActionFinished { status: ActionStatus::Succeeded, detail: None },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("boom")]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a").with_retry(retry(2, 1))]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.attempts, 2);
        assert_eq!(a.detail.as_deref(), Some("failed after 2 attempts: boom"));
        assert_eq!(cluster.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_timeout_is_retried() {
        let cluster = FakeCluster::default().op("install:a", [Op::Hang, Op::Ok]);
        let (orch, _, sink) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a")
            .with_timeout(Duration::from_secs(10))
            .with_retry(retry(2, 1))]);
        let started = Instant::now();
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Succeeded);
        assert_eq!(a.attempts, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(11));
        assert!(sink.events_for("a").contains(&EventKind::AttemptFailed {
            attempt: 1,
            error: "operation timed out after 10.0s".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probe_action_is_retried() {
        let cluster = FakeCluster::default().verdict(
            "api-up",
            [ProbeVerdict::fail("connection refused"), ProbeVerdict::pass("ok")],
        );
        let (orch, _, _) = setup(cluster, Settings::default());
        let plan = plan(vec![Action::probe("api", "api-up").with_retry(retry(2, 1))]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;
        let api = outcome(&report, "api");
        assert_eq!(api.status, ActionStatus::Succeeded);
        assert_eq!(api.attempts, 2);
        assert_eq!(api.detail.as_deref(), Some("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_retry_reinvokes_directly() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("reset"), Op::Ok]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a").with_retry(retry(3, 1)).with_gate(gate("chk", 10))]);
        orch.run(&plan, &[], &CancellationToken::new()).await;
        assert_eq!(cluster.calls(), vec!["install:a", "install:a", "status:chk"]);
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_retry_accepts_ready_target() {
        let cluster = FakeCluster::default()
            .op("install:a", [Op::Err("connection reset")])
            .status("chk", [Ok(ResourceStatus::Ready)]);
        let (orch, cluster, sink) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a")
            .non_idempotent()
            .with_retry(retry(3, 1))
            .with_gate(gate("chk", 10))]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Succeeded);
        assert_eq!(a.attempts, 1);
        assert_eq!(
            a.detail.as_deref(),
            Some("target already ready; earlier attempt took effect")
        );
        assert_eq!(cluster.calls(), vec!["install:a", "status:chk"]);
        assert!(sink.events_for("a").contains(&EventKind::CompensatingCheck {
            ready: true,
            detail: None
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_retry_reinvokes_when_not_ready() {
        let cluster = FakeCluster::default()
            .op("install:a", [Op::Err("connection reset"), Op::Ok])
            .status("chk", [not_ready("missing"), Ok(ResourceStatus::Ready)]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a")
            .non_idempotent()
            .with_retry(retry(3, 1))
            .with_gate(gate("chk", 10))]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Succeeded);
        assert_eq!(a.attempts, 2);
        assert_eq!(a.gate_polls, 1);
        assert_eq!(
            cluster.calls(),
            vec!["install:a", "status:chk", "install:a", "status:chk"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_retry_without_gate_reinvokes() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("connection reset"), Op::Ok]);
        let (orch, cluster, sink) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a").non_idempotent().with_retry(retry(3, 1))]);
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Succeeded);
        assert_eq!(a.attempts, 2);
        assert_eq!(cluster.calls(), vec!["install:a", "install:a"]);
        assert!(!sink
            .events_for("a")
            .iter()
            .any(|e| matches!(e, EventKind::CompensatingCheck { .. })));
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn gate_timeout_is_terminal() {
        let cluster = FakeCluster::default().status("chk", [not_ready("0/1 ready"), Err("deployment not found")]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a").with_retry(retry(3, 1)).with_gate(gate("chk", 5))]);
        let started = Instant::now();
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.failure, Some(FailureKind::GateTimeout));
        assert_eq!(a.attempts, 1);
        assert_eq!(a.gate_polls, 5);
        assert_eq!(
            a.detail.as_deref(),
            Some("not ready after 5 poll(s) in 5.0s; last error: deployment not found; last status: 0/1 ready")
        );
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        let installs = cluster.calls().iter().filter(|c| c.starts_with("install:")).count();
        assert_eq!(installs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gated_action_event_sequence() {
        let (orch, _, sink) = setup(FakeCluster::default(), Settings::default());
        let plan = plan(vec![install("a").with_gate(gate("chk", 10))]);
        orch.run(&plan, &[], &CancellationToken::new()).await;
        assert_eq!(
            sink.events_for("a"),
            vec![
                EventKind::ActionStarted { kind: ActionKind::Install },
                EventKind::AttemptStarted { attempt: 1 },
                EventKind::GatePolled { poll: 1, status: "ready".into(), detail: None },
                EventKind::ActionFinished { status: ActionStatus::Succeeded, detail: None },
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Probes and aggregation
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn end_to_end_gate_timeout_skips_dependent_probe() {
        let cluster = FakeCluster::default()
            .status("a-ready", [not_ready("rolling out"), Ok(ResourceStatus::Ready)])
            .status("b-ready", [not_ready("crashloop")]);
        let (orch, _, _) = setup(cluster, Settings::default());
        let plan = plan(vec![
            install("a").with_gate(gate("a-ready", 10)),
            install("b").depends_on(["a"]).with_gate(gate("b-ready", 5)),
        ]);
        let probes = vec![Probe::new("p1", "p1").requiring(["b"])];
        let report = orch.run(&plan, &probes, &CancellationToken::new()).await;

        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Succeeded);
        assert_eq!(a.gate_polls, 2);
        let b = outcome(&report, "b");
        assert_eq!(b.status, ActionStatus::Failed);
        assert_eq!(b.failure, Some(FailureKind::GateTimeout));
        assert_eq!(report.probe_results.len(), 1);
        assert_eq!(report.probe_results[0].status, ProbeStatus::Skip);
        assert_eq!(report.overall_status, OverallStatus::Failed);
        assert_eq!(report.exit_code, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn required_failure_lists_probes_as_skipped() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("nope")]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a")]);
        let probes = vec![Probe::new("dns", "dns"), Probe::new("api", "api")];
        let report = orch.run(&plan, &probes, &CancellationToken::new()).await;

        assert!(!report.probes_executed);
        let names: Vec<&str> = report.probe_results.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["api", "dns"]);
        for p in &report.probe_results {
            assert_eq!(p.status, ProbeStatus::Skip);
            assert_eq!(p.detail, "not run: required action(s) did not succeed: a");
        }
        assert!(!cluster.calls().iter().any(|c| c.starts_with("probe:")));
    }

    #[tokio::test(start_paused = true)]
    async fn optional_failure_still_runs_probes() {
        let cluster = FakeCluster::default().op("install:extras", [Op::Err("nope")]);
        let (orch, _, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("core"), install("extras").optional()]);
        let probes = vec![Probe::new("dns", "dns")];
        let report = orch.run(&plan, &probes, &CancellationToken::new()).await;

        assert!(report.probes_executed);
        assert_eq!(report.probe_results[0].status, ProbeStatus::Pass);
        assert_eq!(report.overall_status, OverallStatus::Succeeded);
        assert_eq!(report.exit_code, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn optional_failure_with_probe_failure_is_partial() {
        let cluster = FakeCluster::default()
            .op("install:extras", [Op::Err("nope")])
            .verdict("dns", [ProbeVerdict::fail("NXDOMAIN")]);
        let (orch, _, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("core"), install("extras").optional()]);
        let probes = vec![Probe::new("dns", "dns")];
        let report = orch.run(&plan, &probes, &CancellationToken::new()).await;
        assert_eq!(report.overall_status, OverallStatus::Partial);
        assert_eq!(report.exit_code, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn five_probes_two_failing() {
        let cluster = FakeCluster::default()
            .verdict("b", [ProbeVerdict::fail("refused")])
            .verdict("e", [ProbeVerdict::fail("timeout")])
            .verdict("c", [ProbeVerdict::skip("no ingress")]);
        let (orch, _, _) = setup(cluster, Settings::default());
        let probes: Vec<Probe> = ["e", "d", "c", "b", "a"].iter().map(|n| Probe::new(*n, *n)).collect();
        let report = orch.run(&plan(vec![]), &probes, &CancellationToken::new()).await;

        let got: Vec<(&str, ProbeStatus)> = report
            .probe_results
            .iter()
            .map(|p| (p.name.as_str(), p.status))
            .collect();
        assert_eq!(
            got,
            vec![
                ("a", ProbeStatus::Pass),
                ("b", ProbeStatus::Fail),
                ("c", ProbeStatus::Skip),
                ("d", ProbeStatus::Pass),
                ("e", ProbeStatus::Fail),
            ]
        );
        assert_eq!(report.overall_status, OverallStatus::Failed);
        assert_eq!(report.probe_counts.fail, 2);
        assert_eq!(report.probe_counts.skip, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn probes_only_ignores_requires() {
        let (orch, _, _) = setup(FakeCluster::default(), Settings::default());
        let probes = vec![Probe::new("dns", "dns").requiring(["core-dns"])];
        let report = orch.run_probes_only(&probes, &CancellationToken::new()).await;
        assert!(report.plan_results.is_empty());
        assert!(report.probes_executed);
        assert_eq!(report.probe_results[0].status, ProbeStatus::Pass);
        assert_eq!(report.overall_status, OverallStatus::Succeeded);
    }

    // -----------------------------------------------------------------------
    // Cancellation and deadline
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_poll_stops_within_one_interval() {
        let cluster = FakeCluster::default().status("a-ready", [not_ready("pending")]);
        let (orch, cluster, _) = setup(cluster, Settings::default());
        let plan = plan(vec![
            install("a").with_gate(gate("a-ready", 60)),
            install("b").depends_on(["a"]),
            install("c"),
        ]);
        let probes = vec![Probe::new("dns", "dns")];
        let cancel = cancel_after(2_500);
        let started = Instant::now();
        let report = orch.run(&plan, &probes, &cancel).await;

        assert!(started.elapsed() < Duration::from_millis(3_500));
        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Cancelled);
        assert_eq!(a.gate_polls, 3);
        for name in ["b", "c"] {
            let o = outcome(&report, name);
            assert_eq!(o.status, ActionStatus::Skipped);
            assert_eq!(
                o.skip_reason,
                Some(SkipReason::RunStopped {
                    cause: StopCause::Cancelled
                })
            );
        }
        assert!(!cluster.calls().iter().any(|c| c == "install:b" || c == "install:c"));
        assert_eq!(report.probe_results[0].status, ProbeStatus::Skip);
        assert!(report.cancelled);
        assert_eq!(report.overall_status, OverallStatus::Cancelled);
        assert_eq!(report.exit_code, 130);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("nope")]);
        let (orch, _, _) = setup(cluster, Settings::default());
        let plan = plan(vec![install("a").with_retry(retry(5, 60))]);
        let cancel = cancel_after(1_000);
        let started = Instant::now();
        let report = orch.run(&plan, &[], &cancel).await;

        assert_eq!(started.elapsed(), Duration::from_secs(1));
        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Cancelled);
        assert_eq!(a.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_running_action_and_stops_the_rest() {
        let cluster = FakeCluster::default().op("install:a", [Op::Hang]);
        let settings = Settings {
            deadline: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let (orch, cluster, _) = setup(cluster, settings);
        let plan = plan(vec![install("a"), install("b")]);
        let started = Instant::now();
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        assert_eq!(started.elapsed(), Duration::from_secs(5));
        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.detail.as_deref(), Some("run deadline reached during the operation"));
        assert_eq!(
            outcome(&report, "b").skip_reason,
            Some(SkipReason::RunStopped {
                cause: StopCause::Deadline
            })
        );
        assert_eq!(cluster.calls(), vec!["install:a"]);
        assert!(report.deadline_exceeded);
        assert!(!report.cancelled);
        assert_eq!(report.overall_status, OverallStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_deadline_fails_immediately() {
        let cluster = FakeCluster::default().op("install:a", [Op::Err("nope")]);
        let settings = Settings {
            deadline: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let (orch, _, _) = setup(cluster, settings);
        let plan = plan(vec![install("a").with_retry(retry(5, 10))]);
        let started = Instant::now();
        let report = orch.run(&plan, &[], &CancellationToken::new()).await;

        assert_eq!(started.elapsed(), Duration::ZERO);
        let a = outcome(&report, "a");
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.attempts, 1);
        assert_eq!(
            a.detail.as_deref(),
            Some("nope (run deadline leaves no time to retry)")
        );
    }
}
