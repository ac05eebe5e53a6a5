//! Action data model.
//!
//! An `Action` is one named step of a bootstrap plan: install a component,
//! apply a manifest, or run a probe. Definitions are immutable once a plan is
//! built; execution state lives in the orchestrator's `ActionOutcome`s so the
//! same definition can be replayed across runs.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{ConvergeError, Result};
use crate::gate::GateSpec;
use crate::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Install,
    ApplyManifest,
    Probe,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Install => "install",
            ActionKind::ApplyManifest => "apply_manifest",
            ActionKind::Probe => "probe",
        }
    }

    /// Install-class actions mutate the cluster and may carry a readiness gate.
    pub fn is_install_class(&self) -> bool {
        matches!(self, ActionKind::Install | ActionKind::ApplyManifest)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operation payloads
// ---------------------------------------------------------------------------

/// What to install. `component` is a display label; `command` does the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub command: String,
}

/// A manifest document applied through the configured apply command.
/// Relative paths resolve against the plan file's directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRef {
    pub manifest: PathBuf,
}

/// A diagnostic check. Used both for probe-kind actions and for the
/// post-convergence probe suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Install(ComponentSpec),
    ApplyManifest(ManifestRef),
    Probe(ProbeSpec),
}

impl Operation {
    pub fn kind(&self) -> ActionKind {
        match self {
            Operation::Install(_) => ActionKind::Install,
            Operation::ApplyManifest(_) => ActionKind::ApplyManifest,
            Operation::Probe(_) => ActionKind::Probe,
        }
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAction")]
pub struct Action {
    pub name: String,
    #[serde(flatten)]
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Bound on a single invocation of the operation.
    #[serde(
        rename = "timeout_seconds",
        with = "crate::serde_secs",
        default = "default_action_timeout"
    )]
    pub timeout: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    /// Optional actions may fail without failing the run.
    #[serde(default)]
    pub optional: bool,
    /// Re-invoking an idempotent operation is always safe. Non-idempotent
    /// operations get a readiness check before each retry instead.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
}

fn default_action_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_idempotent() -> bool {
    true
}

/// On-disk shape of an action. `Action` flattens its operation, which rules
/// out `deny_unknown_fields`, so every payload key is listed here instead
/// and checked against `kind` on conversion.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    name: String,
    kind: ActionKind,
    #[serde(default)]
    component: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    manifest: Option<PathBuf>,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(
        rename = "timeout_seconds",
        with = "crate::serde_secs",
        default = "default_action_timeout"
    )]
    timeout: Duration,
    #[serde(default)]
    retry: Option<RetryPolicy>,
    #[serde(default)]
    gate: Option<GateSpec>,
    #[serde(default)]
    optional: bool,
    #[serde(default = "default_idempotent")]
    idempotent: bool,
}

impl TryFrom<RawAction> for Action {
    type Error = String;

    fn try_from(raw: RawAction) -> std::result::Result<Self, String> {
        let name = raw.name;
        let stray = |field: &str| format!("action '{name}': '{field}' does not apply to kind {}", raw.kind);
        let missing = |field: &str| format!("action '{name}': kind {} requires '{field}'", raw.kind);

        let operation = match raw.kind {
            ActionKind::Install => {
                if raw.manifest.is_some() {
                    return Err(stray("manifest"));
                }
                Operation::Install(ComponentSpec {
                    component: raw.component,
                    command: raw.command.ok_or_else(|| missing("command"))?,
                })
            }
            ActionKind::ApplyManifest => {
                if raw.command.is_some() {
                    return Err(stray("command"));
                }
                if raw.component.is_some() {
                    return Err(stray("component"));
                }
                Operation::ApplyManifest(ManifestRef {
                    manifest: raw.manifest.ok_or_else(|| missing("manifest"))?,
                })
            }
            ActionKind::Probe => {
                if raw.manifest.is_some() {
                    return Err(stray("manifest"));
                }
                if raw.component.is_some() {
                    return Err(stray("component"));
                }
                Operation::Probe(ProbeSpec {
                    command: raw.command.ok_or_else(|| missing("command"))?,
                })
            }
        };

        Ok(Action {
            name,
            operation,
            depends_on: raw.depends_on,
            timeout: raw.timeout,
            retry: raw.retry,
            gate: raw.gate,
            optional: raw.optional,
            idempotent: raw.idempotent,
        })
    }
}

impl Action {
    fn with_operation(name: impl Into<String>, operation: Operation) -> Self {
        Self {
            name: name.into(),
            operation,
            depends_on: Vec::new(),
            timeout: default_action_timeout(),
            retry: None,
            gate: None,
            optional: false,
            idempotent: true,
        }
    }

    pub fn install(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_operation(
            name,
            Operation::Install(ComponentSpec {
                component: None,
                command: command.into(),
            }),
        )
    }

    pub fn apply_manifest(name: impl Into<String>, manifest: impl Into<PathBuf>) -> Self {
        Self::with_operation(
            name,
            Operation::ApplyManifest(ManifestRef {
                manifest: manifest.into(),
            }),
        )
    }

    pub fn probe(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_operation(
            name,
            Operation::Probe(ProbeSpec {
                command: command.into(),
            }),
        )
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_gate(mut self, gate: GateSpec) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn kind(&self) -> ActionKind {
        self.operation.kind()
    }

    /// Total attempts allowed for the operation.
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map(|r| r.max_attempts).unwrap_or(1)
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9._\-]*$").unwrap())
}

/// Validate an action or probe name.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(ConvergeError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
