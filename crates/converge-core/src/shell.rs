//! Shell-backed collaborators.
//!
//! `ShellClient` drives the cluster through whatever CLI tooling the plan
//! names: every operation, readiness check and probe is a `sh -c` command run
//! in the plan's directory with the plan's vars exported. Exit codes carry
//! the result:
//!
//! | command      | 0     | 1         | 77   | other / spawn failure |
//! |--------------|-------|-----------|------|-----------------------|
//! | operation    | ok    | error     | error| error                 |
//! | gate check   | ready | not ready | error| error                 |
//! | probe        | pass  | fail      | skip | fail / error          |

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;

use crate::action::{ComponentSpec, ManifestRef, ProbeSpec};
use crate::client::{ClusterClient, ProbeExecutor, ResourceStatus};
use crate::config::Settings;
use crate::gate::ResourceRef;
use crate::probe::ProbeVerdict;

/// Exit code a probe uses to say it does not apply (automake's SKIP).
pub const PROBE_SKIP_EXIT: i32 = 77;

/// Command output kept for details, counted from the end.
const MAX_OUTPUT: usize = 10 * 1024;

#[derive(Debug, Default, Clone, Copy)]
pub struct ShellClient;

impl ShellClient {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` and collect its output. The child is killed if the
    /// returned future is dropped (timeout or cancellation).
    async fn exec(&self, command: &str, settings: &Settings) -> anyhow::Result<Output> {
        tracing::debug!(command, cwd = %settings.workdir.display(), "running");
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&settings.workdir)
            .envs(&settings.vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{command}`"))
    }

    async fn run_operation(&self, command: &str, settings: &Settings) -> anyhow::Result<()> {
        let output = self.exec(command, settings).await?;
        if output.status.success() {
            return Ok(());
        }
        let detail = format_output(&output);
        match output.status.code() {
            Some(code) if detail.is_empty() => bail!("`{command}` exited with code {code}"),
            Some(code) => bail!("`{command}` exited with code {code}: {detail}"),
            None => bail!("`{command}` was terminated by a signal"),
        }
    }
}

#[async_trait]
impl ClusterClient for ShellClient {
    async fn install(&self, component: &ComponentSpec, settings: &Settings) -> anyhow::Result<()> {
        if let Some(name) = &component.component {
            tracing::debug!(component = %name, "installing");
        }
        self.run_operation(&component.command, settings).await
    }

    async fn apply_manifest(
        &self,
        manifest: &ManifestRef,
        settings: &Settings,
    ) -> anyhow::Result<()> {
        let command = apply_command(&settings.apply_command, &manifest.manifest);
        self.run_operation(&command, settings).await
    }

    async fn get_status(
        &self,
        resource: &ResourceRef,
        settings: &Settings,
    ) -> anyhow::Result<ResourceStatus> {
        let output = self.exec(&resource.check, settings).await?;
        let detail = format_output(&output);
        match output.status.code() {
            Some(0) => Ok(ResourceStatus::Ready),
            Some(1) => Ok(ResourceStatus::NotReady(detail)),
            Some(code) if detail.is_empty() => bail!("check exited with code {code}"),
            Some(code) => bail!("check exited with code {code}: {detail}"),
            None => bail!("check was terminated by a signal"),
        }
    }
}

#[async_trait]
impl ProbeExecutor for ShellClient {
    async fn run_probe(&self, probe: &ProbeSpec, settings: &Settings) -> anyhow::Result<ProbeVerdict> {
        let output = self.exec(&probe.command, settings).await?;
        let detail = format_output(&output);
        Ok(match output.status.code() {
            Some(0) => ProbeVerdict::pass(detail),
            Some(PROBE_SKIP_EXIT) => ProbeVerdict::skip(detail),
            Some(code) if detail.is_empty() => ProbeVerdict::fail(format!("exited with code {code}")),
            Some(_) => ProbeVerdict::fail(detail),
            None => ProbeVerdict::fail("terminated by a signal"),
        })
    }
}

/// `<apply_command> '<path>'`, with the path single-quoted for `sh`.
fn apply_command(prefix: &str, manifest: &Path) -> String {
    let path = manifest.to_string_lossy().replace('\'', r"'\''");
    format!("{prefix} '{path}'")
}

/// Combined stdout and stderr, trimmed, keeping the last `MAX_OUTPUT` bytes.
fn format_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let (stdout, stderr) = (stdout.trim(), stderr.trim());
    let combined = match (stdout.is_empty(), stderr.is_empty()) {
        (_, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    };
    tail(&combined, MAX_OUTPUT).to_string()
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
