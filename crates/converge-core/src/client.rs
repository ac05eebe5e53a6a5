//! Boundary capabilities the orchestrator drives.
//!
//! Everything that touches the cluster goes through these traits. The
//! orchestrator treats each call as opaque and possibly failing; how a call
//! is carried out (API request, CLI invocation) is the implementor's concern.

use async_trait::async_trait;

use crate::action::{ComponentSpec, ManifestRef, ProbeSpec};
use crate::config::Settings;
use crate::gate::ResourceRef;
use crate::probe::ProbeVerdict;

/// Observed state of a gated resource. A check that cannot be evaluated at
/// all is reported as `Err` instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    Ready,
    NotReady(String),
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Install (or upgrade) a component. Must be safe to repeat when the
    /// owning action is declared idempotent.
    async fn install(&self, component: &ComponentSpec, settings: &Settings) -> anyhow::Result<()>;

    async fn apply_manifest(&self, manifest: &ManifestRef, settings: &Settings)
        -> anyhow::Result<()>;

    async fn get_status(
        &self,
        resource: &ResourceRef,
        settings: &Settings,
    ) -> anyhow::Result<ResourceStatus>;
}

#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    /// Run one diagnostic check. `Err` means the probe itself faulted.
    async fn run_probe(&self, probe: &ProbeSpec, settings: &Settings)
        -> anyhow::Result<ProbeVerdict>;
}
