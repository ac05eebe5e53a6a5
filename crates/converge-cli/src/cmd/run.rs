use anyhow::Context;
use clap::Args;
use converge_core::{
    config::{parse_var, PlanConfig, WarnLevel},
    ActionStatus, Orchestrator, ProbeStatus, Report, ShellClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::output::{one_line, print_json, print_table, print_warnings};

#[derive(Args)]
pub struct RunArgs {
    /// Path to the plan file
    pub plan: PathBuf,

    /// Overall run deadline in seconds (overrides settings.deadline_seconds)
    #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    /// Skip the actions and run only the probe suite
    #[arg(long)]
    pub probes_only: bool,

    /// Maximum number of probes running at once
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Variable exported to every command; repeatable
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    converge_core::config::parse_seconds(raw).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(args: RunArgs, json: bool) -> anyhow::Result<i32> {
    let mut config = PlanConfig::load(&args.plan)
        .with_context(|| format!("failed to load plan {}", args.plan.display()))?;

    if let Some(deadline) = args.timeout {
        config.settings.deadline = Some(deadline);
    }
    if let Some(n) = args.concurrency {
        config.settings.probe_concurrency = n;
    }
    config.settings.vars.extend(args.vars);
    let probes_only = args.probes_only;

    let findings = config.validate();
    print_warnings(&findings);
    if findings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("plan {} has errors; nothing was run", args.plan.display());
    }
    config.settings.check_prerequisites()?;
    let blueprint = config.into_blueprint().context("invalid plan")?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async move {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling run");
                on_interrupt.cancel();
            }
        });

        let shell = Arc::new(ShellClient::new());
        let orchestrator = Orchestrator::new(shell.clone(), shell, blueprint.settings.clone());
        if probes_only {
            orchestrator.run_probes_only(&blueprint.probes, &cancel).await
        } else {
            orchestrator
                .run(&blueprint.plan, &blueprint.probes, &cancel)
                .await
        }
    });

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.exit_code)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn seconds(ms: u64) -> String {
    format!("{:.1}s", ms as f64 / 1000.0)
}

fn print_report(report: &Report) {
    if !report.plan_results.is_empty() {
        let rows = report
            .plan_results
            .iter()
            .map(|o| {
                let status = if o.optional && o.status == ActionStatus::Failed {
                    "failed (optional)".to_string()
                } else {
                    o.status.to_string()
                };
                vec![
                    o.name.clone(),
                    o.kind.to_string(),
                    status,
                    o.attempts.to_string(),
                    seconds(o.duration_ms),
                    one_line(o.detail.as_deref().unwrap_or(""), 80),
                ]
            })
            .collect();
        print_table(
            &["ACTION", "KIND", "STATUS", "ATTEMPTS", "TIME", "DETAIL"],
            rows,
        );
        println!();
    }

    if !report.probe_results.is_empty() {
        let rows = report
            .probe_results
            .iter()
            .map(|p| {
                vec![
                    p.name.clone(),
                    p.status.to_string(),
                    seconds(p.duration_ms),
                    one_line(&p.detail, 80),
                ]
            })
            .collect();
        print_table(&["PROBE", "STATUS", "TIME", "DETAIL"], rows);
        println!();
    }

    let a = &report.action_counts;
    let p = &report.probe_counts;
    let mut summary = format!(
        "{}: actions {} succeeded, {} failed, {} skipped",
        report.overall_status, a.succeeded, a.failed, a.skipped
    );
    if a.cancelled > 0 {
        summary.push_str(&format!(", {} cancelled", a.cancelled));
    }
    summary.push_str(&format!(
        "; probes {} pass, {} fail, {} skip",
        p.pass, p.fail, p.skip
    ));
    if p.cancelled > 0 {
        summary.push_str(&format!(", {} cancelled", p.cancelled));
    }
    if report.deadline_exceeded {
        summary.push_str(" (deadline exceeded)");
    }
    println!("{summary}");

    let failed_probes: Vec<&str> = report
        .probe_results
        .iter()
        .filter(|p| p.status == ProbeStatus::Fail)
        .map(|p| p.name.as_str())
        .collect();
    let required = report.required_failures();
    if !required.is_empty() {
        println!("required action(s) not converged: {}", required.join(", "));
    }
    if !failed_probes.is_empty() {
        println!("failing probe(s): {}", failed_probes.join(", "));
    }
}
