//! Run report and the rules that derive the overall status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::{ActionOutcome, ActionStatus};
use crate::probe::{ProbeResult, ProbeStatus};

// ---------------------------------------------------------------------------
// OverallStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Succeeded,
    /// Every required action succeeded, but an optional action failed and
    /// at least one probe failed.
    Partial,
    Failed,
    Cancelled,
}

impl OverallStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            OverallStatus::Succeeded => 0,
            OverallStatus::Failed => 1,
            OverallStatus::Partial => 2,
            OverallStatus::Cancelled => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Succeeded => "succeeded",
            OverallStatus::Partial => "partial",
            OverallStatus::Failed => "failed",
            OverallStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the overall status. Precedence: failed, cancelled, partial,
/// succeeded.
pub fn overall_status(
    plan_results: &[ActionOutcome],
    probe_results: &[ProbeResult],
    cancelled: bool,
) -> OverallStatus {
    let required_failed = plan_results.iter().any(ActionOutcome::blocks_run);
    let optional_failed = plan_results
        .iter()
        .any(|o| o.optional && o.status == ActionStatus::Failed);
    let probe_failed = probe_results.iter().any(|p| p.status == ProbeStatus::Fail);

    if required_failed || (probe_failed && !optional_failed) {
        OverallStatus::Failed
    } else if cancelled {
        OverallStatus::Cancelled
    } else if probe_failed {
        OverallStatus::Partial
    } else {
        OverallStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl ActionCounts {
    fn tally(results: &[ActionOutcome]) -> Self {
        let mut c = Self::default();
        for r in results {
            match r.status {
                ActionStatus::Succeeded => c.succeeded += 1,
                ActionStatus::Failed => c.failed += 1,
                ActionStatus::Skipped => c.skipped += 1,
                ActionStatus::Cancelled => c.cancelled += 1,
                ActionStatus::Pending | ActionStatus::Running => {}
            }
        }
        c
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCounts {
    pub pass: usize,
    pub fail: usize,
    pub skip: usize,
    pub cancelled: usize,
}

impl ProbeCounts {
    fn tally(results: &[ProbeResult]) -> Self {
        let mut c = Self::default();
        for r in results {
            match r.status {
                ProbeStatus::Pass => c.pass += 1,
                ProbeStatus::Fail => c.fail += 1,
                ProbeStatus::Skip => c.skip += 1,
                ProbeStatus::Cancelled => c.cancelled += 1,
            }
        }
        c
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub exit_code: i32,
    /// Per-action outcomes in execution order.
    pub plan_results: Vec<ActionOutcome>,
    /// Sorted by probe name.
    pub probe_results: Vec<ProbeResult>,
    pub action_counts: ActionCounts,
    pub probe_counts: ProbeCounts,
    pub probes_executed: bool,
    pub cancelled: bool,
    pub deadline_exceeded: bool,
}

impl Report {
    /// Names of required actions that failed the run.
    pub fn required_failures(&self) -> Vec<&str> {
        self.plan_results
            .iter()
            .filter(|o| o.blocks_run())
            .map(|o| o.name.as_str())
            .collect()
    }
}

/// Collects run-level facts, then folds the results into a `Report`.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    cancelled: bool,
    deadline_exceeded: bool,
    probes_executed: bool,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            cancelled: false,
            deadline_exceeded: false,
            probes_executed: false,
        }
    }

    pub fn cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn deadline_exceeded(mut self, exceeded: bool) -> Self {
        self.deadline_exceeded = exceeded;
        self
    }

    pub fn probes_executed(mut self, executed: bool) -> Self {
        self.probes_executed = executed;
        self
    }

    pub fn aggregate(
        self,
        plan_results: Vec<ActionOutcome>,
        mut probe_results: Vec<ProbeResult>,
    ) -> Report {
        probe_results.sort_by(|a, b| a.name.cmp(&b.name));
        let overall = overall_status(&plan_results, &probe_results, self.cancelled);
        Report {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            overall_status: overall,
            exit_code: overall.exit_code(),
            action_counts: ActionCounts::tally(&plan_results),
            probe_counts: ProbeCounts::tally(&probe_results),
            plan_results,
            probe_results,
            probes_executed: self.probes_executed,
            cancelled: self.cancelled,
            deadline_exceeded: self.deadline_exceeded,
        }
    }
}
