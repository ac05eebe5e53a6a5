//! Dependency plan: validated action graph plus its execution order.
//!
//! Ordering uses Kahn's algorithm. Among actions whose dependencies are all
//! placed, the one declared first goes next, so the same plan always yields
//! the same order.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::action::{validate_name, Action};
use crate::error::{ConvergeError, Result};

#[derive(Debug, Clone)]
pub struct DependencyPlan {
    actions: Vec<Action>,
    index: HashMap<String, usize>,
    /// Deduplicated dependency indices, per action, in declaration order.
    deps: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyPlan {
    /// Validate `actions` and compute the execution order.
    ///
    /// Fails on invalid or duplicate names, self-dependencies, unknown
    /// dependencies, malformed gate or retry settings, and cycles.
    pub fn new(actions: Vec<Action>) -> Result<Self> {
        let mut index = HashMap::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            validate_name(&action.name)?;
            if index.insert(action.name.clone(), i).is_some() {
                return Err(ConvergeError::DuplicateAction(action.name.clone()));
            }
            validate_definition(action)?;
        }

        let mut deps = Vec::with_capacity(actions.len());
        for action in &actions {
            let mut seen = HashSet::new();
            let mut resolved = Vec::with_capacity(action.depends_on.len());
            for dep in &action.depends_on {
                if dep == &action.name {
                    return Err(ConvergeError::SelfDependency(action.name.clone()));
                }
                let &j = index
                    .get(dep)
                    .ok_or_else(|| ConvergeError::UnknownDependency {
                        action: action.name.clone(),
                        dependency: dep.clone(),
                    })?;
                if seen.insert(j) {
                    resolved.push(j);
                }
            }
            deps.push(resolved);
        }

        let order = topological_order(&actions, &deps)?;
        Ok(Self {
            actions,
            index,
            deps,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Actions in declaration order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn get(&self, name: &str) -> Option<&Action> {
        self.index.get(name).map(|&i| &self.actions[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declaration indices in execution order.
    pub fn order_indices(&self) -> &[usize] {
        &self.order
    }

    /// Actions in execution order.
    pub fn ordered(&self) -> impl Iterator<Item = &Action> + '_ {
        self.order.iter().map(move |&i| &self.actions[i])
    }

    pub fn order_names(&self) -> Vec<&str> {
        self.ordered().map(|a| a.name.as_str()).collect()
    }

    /// Declaration indices of the direct dependencies of action `i`.
    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }
}

fn validate_definition(action: &Action) -> Result<()> {
    if let Some(gate) = &action.gate {
        if !action.kind().is_install_class() {
            return Err(ConvergeError::GateOnProbe(action.name.clone()));
        }
        if gate.poll_interval.is_zero() {
            return Err(ConvergeError::InvalidGate {
                action: action.name.clone(),
                reason: "poll_interval_seconds must be greater than zero".to_string(),
            });
        }
    }
    if let Some(retry) = &action.retry {
        retry
            .validate()
            .map_err(|reason| ConvergeError::InvalidRetryPolicy {
                action: action.name.clone(),
                reason,
            })?;
    }
    Ok(())
}

fn topological_order(actions: &[Action], deps: &[Vec<usize>]) -> Result<Vec<usize>> {
    let n = actions.len();
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            dependents[d].push(i);
        }
    }

    // BTreeSet pops the lowest declaration index first.
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let unresolved: Vec<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
    let cycle = find_cycle(&unresolved, deps, &in_degree)
        .into_iter()
        .map(|i| actions[i].name.clone())
        .collect();
    Err(ConvergeError::CyclicDependency {
        cycle,
        unresolved: unresolved
            .iter()
            .map(|&i| actions[i].name.clone())
            .collect(),
    })
}

/// Walk dependency edges inside the unresolved set until a node repeats.
///
/// Every unresolved node still has at least one unresolved dependency, so the
/// walk cannot dead-end. The returned path starts and ends on the same node.
fn find_cycle(unresolved: &[usize], deps: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let Some(&start) = unresolved.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let Some(&next) = deps[current].iter().find(|&&d| in_degree[d] > 0) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle = path.split_off(at);
            cycle.push(next);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
