use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("invalid name '{0}': must be lowercase alphanumeric with '.', '_' or '-' (max 64 chars)")]
    InvalidName(String),

    #[error("duplicate action: {0}")]
    DuplicateAction(String),

    #[error("duplicate probe: {0}")]
    DuplicateProbe(String),

    #[error("action '{0}' depends on itself")]
    SelfDependency(String),

    #[error("action '{action}' depends on unknown action '{dependency}'")]
    UnknownDependency { action: String, dependency: String },

    #[error(
        "cyclic dependency: {} (unresolved: {})",
        .cycle.join(" -> "),
        .unresolved.join(", ")
    )]
    CyclicDependency {
        cycle: Vec<String>,
        unresolved: Vec<String>,
    },

    #[error("action '{0}' is a probe and cannot carry a readiness gate")]
    GateOnProbe(String),

    #[error("invalid readiness gate on '{action}': {reason}")]
    InvalidGate { action: String, reason: String },

    #[error("invalid retry policy on '{action}': {reason}")]
    InvalidRetryPolicy { action: String, reason: String },

    #[error("invalid variable '{0}': expected KEY=VALUE")]
    InvalidVar(String),

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("prerequisite not found: {tool} (listed in settings.requires_tools)")]
    PrerequisiteNotFound { tool: String },

    #[error("plan file not found: {0}")]
    PlanNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, ConvergeError>;
