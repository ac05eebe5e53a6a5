//! `converge-core`: bootstrap a platform from a declarative plan, then check it.
//!
//! # Architecture
//!
//! ```text
//! PlanConfig (YAML)
//!     │  into_blueprint()
//!     ▼
//! DependencyPlan  ← validated actions in topological order
//!     │
//!     ▼
//! Orchestrator    ← invoke → retry → readiness gate, one action at a time
//!     │              failures skip dependents; independent branches go on
//!     ▼
//! ProbeSuite      ← concurrent diagnostic probes (pass | fail | skip)
//!     │
//!     ▼
//! Report          ← overall status + exit code
//! ```
//!
//! The cluster is reached only through `ClusterClient` and `ProbeExecutor`;
//! `ShellClient` implements both with `sh -c`.

pub mod action;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod plan;
pub mod probe;
pub mod report;
pub mod retry;
mod serde_secs;
pub mod shell;

pub use action::{Action, ActionKind, Operation};
pub use client::{ClusterClient, ProbeExecutor, ResourceStatus};
pub use config::{Blueprint, ConfigWarning, PlanConfig, Settings, WarnLevel};
pub use error::{ConvergeError, Result};
pub use events::{Event, EventKind, EventSink, RecordingSink, TracingSink};
pub use gate::{GateSpec, ReadinessGate};
pub use orchestrator::{ActionOutcome, ActionStatus, Orchestrator};
pub use plan::DependencyPlan;
pub use probe::{Probe, ProbeResult, ProbeStatus, ProbeSuite, ProbeVerdict};
pub use report::{OverallStatus, Report, ResultAggregator};
pub use retry::RetryPolicy;
pub use shell::ShellClient;
