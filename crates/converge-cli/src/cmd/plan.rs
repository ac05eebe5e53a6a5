use anyhow::Context;
use converge_core::{
    config::{PlanConfig, WarnLevel},
    ActionKind,
};
use serde::Serialize;
use std::path::Path;

use crate::output::{print_json, print_table, print_warnings};

#[derive(Serialize)]
struct PlanStep<'a> {
    position: usize,
    name: &'a str,
    kind: ActionKind,
    depends_on: &'a [String],
    optional: bool,
    max_attempts: u32,
    gated: bool,
}

#[derive(Serialize)]
struct PlanView<'a> {
    actions: Vec<PlanStep<'a>>,
    probes: Vec<&'a str>,
}

pub fn run(plan_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = PlanConfig::load(plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    let findings = config.validate();
    print_warnings(&findings);
    if findings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("plan {} has errors", plan_path.display());
    }
    let blueprint = config.into_blueprint().context("invalid plan")?;

    let actions: Vec<PlanStep> = blueprint
        .plan
        .ordered()
        .enumerate()
        .map(|(i, a)| PlanStep {
            position: i + 1,
            name: &a.name,
            kind: a.kind(),
            depends_on: &a.depends_on,
            optional: a.optional,
            max_attempts: a.max_attempts(),
            gated: a.gate.is_some(),
        })
        .collect();
    let view = PlanView {
        actions,
        probes: blueprint.probes.iter().map(|p| p.name.as_str()).collect(),
    };

    if json {
        return print_json(&view);
    }

    if view.actions.is_empty() {
        println!("No actions.");
    } else {
        let rows = view
            .actions
            .iter()
            .map(|s| {
                let mut flags = Vec::new();
                if s.gated {
                    flags.push("gated".to_string());
                }
                if s.max_attempts > 1 {
                    flags.push(format!("retry x{}", s.max_attempts));
                }
                if s.optional {
                    flags.push("optional".to_string());
                }
                vec![
                    s.position.to_string(),
                    s.name.to_string(),
                    s.kind.to_string(),
                    s.depends_on.join(", "),
                    flags.join(", "),
                ]
            })
            .collect();
        print_table(&["#", "ACTION", "KIND", "DEPENDS ON", "FLAGS"], rows);
    }

    if !view.probes.is_empty() {
        println!();
        println!("probes: {}", view.probes.join(", "));
    }
    Ok(())
}
