use crate::action::{validate_name, Action, Operation};
use crate::error::{ConvergeError, Result};
use crate::plan::DependencyPlan;
use crate::probe::Probe;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Run-wide configuration shared by every action and probe.
///
/// Built once from the plan file (plus CLI overrides) and then frozen behind
/// an `Arc`; nothing mutates it during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Overall run deadline, checked between actions and used as a ceiling
    /// for every operation, gate and probe timeout.
    #[serde(
        rename = "deadline_seconds",
        with = "crate::serde_secs::option",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Duration>,
    #[serde(default = "default_probe_concurrency")]
    pub probe_concurrency: usize,
    /// How long in-flight probes may keep running after cancellation.
    #[serde(
        rename = "probe_grace_seconds",
        with = "crate::serde_secs",
        default = "default_probe_grace"
    )]
    pub probe_grace: Duration,
    /// Command prefix used to apply manifests; the manifest path is appended.
    #[serde(default = "default_apply_command")]
    pub apply_command: String,
    /// Executables that must be on `PATH` before anything runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_tools: Vec<String>,
    /// Exported as environment variables to every command.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
    /// Directory commands run in. Set to the plan file's directory on load.
    #[serde(skip)]
    pub workdir: PathBuf,
}

fn default_probe_concurrency() -> usize {
    4
}

fn default_probe_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_apply_command() -> String {
    "kubectl apply -f".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            deadline: None,
            probe_concurrency: default_probe_concurrency(),
            probe_grace: default_probe_grace(),
            apply_command: default_apply_command(),
            requires_tools: Vec::new(),
            vars: BTreeMap::new(),
            workdir: PathBuf::from("."),
        }
    }
}

impl Settings {
    /// Concurrency limit actually used by the probe pool (never zero).
    pub fn effective_probe_concurrency(&self) -> usize {
        self.probe_concurrency.max(1)
    }

    /// Verify every tool in `requires_tools` resolves on `PATH`.
    pub fn check_prerequisites(&self) -> Result<()> {
        for tool in &self.requires_tools {
            if which::which(tool).is_err() {
                return Err(ConvergeError::PrerequisiteNotFound { tool: tool.clone() });
            }
        }
        Ok(())
    }
}

/// Parse a `KEY=VALUE` pair as given to `--var`.
pub fn parse_var(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if is_env_key(key) => Ok((key.to_string(), value.to_string())),
        _ => Err(ConvergeError::InvalidVar(raw.to_string())),
    }
}

fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a seconds value given on the command line.
pub fn parse_seconds(raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ConvergeError::InvalidDuration(raw.to_string()))?;
    crate::serde_secs::parse(secs).map_err(ConvergeError::InvalidDuration)
}

// ---------------------------------------------------------------------------
// PlanConfig
// ---------------------------------------------------------------------------

/// A plan file as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub probes: Vec<Probe>,
}

/// A validated plan ready to run.
#[derive(Debug, Clone)]
pub struct Blueprint {
    pub plan: DependencyPlan,
    pub probes: Vec<Probe>,
    pub settings: Arc<Settings>,
}

impl PlanConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConvergeError::PlanNotFound(path.display().to_string()));
        }
        let data = std::fs::read_to_string(path)?;
        let base = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::from_yaml_str(&data, &base)
    }

    pub fn from_yaml_str(yaml: &str, base_dir: &Path) -> Result<Self> {
        let mut cfg: PlanConfig = serde_yaml::from_str(yaml)?;
        cfg.settings.workdir = base_dir.to_path_buf();
        Ok(cfg)
    }

    /// Build the dependency plan and freeze the settings.
    pub fn into_blueprint(self) -> Result<Blueprint> {
        let mut seen = HashSet::new();
        for probe in &self.probes {
            validate_name(&probe.name)?;
            if !seen.insert(probe.name.as_str()) {
                return Err(ConvergeError::DuplicateProbe(probe.name.clone()));
            }
        }
        let plan = DependencyPlan::new(self.actions)?;
        Ok(Blueprint {
            plan,
            probes: self.probes,
            settings: Arc::new(self.settings),
        })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Non-fatal findings. Structural problems are reported by
    /// `into_blueprint` instead.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let names: HashSet<&str> = self.actions.iter().map(|a| a.name.as_str()).collect();

        if self.settings.probe_concurrency == 0 {
            warnings.push(ConfigWarning::warning(
                "settings.probe_concurrency is 0; probes will run one at a time",
            ));
        }

        for action in &self.actions {
            match &action.operation {
                Operation::Install(spec) if spec.command.trim().is_empty() => {
                    warnings.push(ConfigWarning::warning(format!(
                        "action '{}' has an empty command",
                        action.name
                    )));
                }
                Operation::Probe(spec) if spec.command.trim().is_empty() => {
                    warnings.push(ConfigWarning::warning(format!(
                        "action '{}' has an empty command",
                        action.name
                    )));
                }
                Operation::ApplyManifest(m) => {
                    let path = self.settings.workdir.join(&m.manifest);
                    if !path.exists() {
                        warnings.push(ConfigWarning::error(format!(
                            "action '{}' applies '{}', which does not exist",
                            action.name,
                            m.manifest.display()
                        )));
                    }
                }
                _ => {}
            }

            if let Some(gate) = &action.gate {
                if gate.check.trim().is_empty() {
                    warnings.push(ConfigWarning::warning(format!(
                        "gate on action '{}' has an empty check",
                        action.name
                    )));
                }
                let gate_timeout = gate.timeout.unwrap_or(action.timeout);
                if let Some(deadline) = self.settings.deadline {
                    if gate_timeout > deadline {
                        warnings.push(ConfigWarning::warning(format!(
                            "gate on action '{}' waits up to {}s, longer than the {}s run deadline",
                            action.name,
                            gate_timeout.as_secs_f64(),
                            deadline.as_secs_f64()
                        )));
                    }
                }
                if gate.poll_interval > gate_timeout {
                    warnings.push(ConfigWarning::warning(format!(
                        "gate on action '{}' polls less often than its timeout; it will be checked once",
                        action.name
                    )));
                }
            }

            if let Some(retry) = &action.retry {
                if retry.max_attempts > 10 {
                    warnings.push(ConfigWarning::warning(format!(
                        "action '{}' has max_attempts={} (>10 is unusual)",
                        action.name, retry.max_attempts
                    )));
                }
            }

            if !action.idempotent && action.retry.is_some() && action.gate.is_none() {
                warnings.push(ConfigWarning::warning(format!(
                    "action '{}' is non-idempotent and retried but has no gate to check before retrying",
                    action.name
                )));
            }
        }

        for probe in &self.probes {
            if probe.spec.command.trim().is_empty() {
                warnings.push(ConfigWarning::warning(format!(
                    "probe '{}' has an empty command",
                    probe.name
                )));
            }
            for req in &probe.requires {
                if !names.contains(req.as_str()) {
                    warnings.push(ConfigWarning::warning(format!(
                        "probe '{}' requires unknown action '{}'",
                        probe.name, req
                    )));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
