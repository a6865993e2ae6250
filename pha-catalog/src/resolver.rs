//! Dependency resolution: expand a requested policy set with its gating
//! dependencies, reject conflicts, and produce an apply-safe order
//! (spec §4.2).

use std::collections::{HashMap, HashSet, VecDeque};

use pha_protocol::policy::{DependencyKind, Policy, PolicyId};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown policy: {0}")]
    UnknownPolicy(PolicyId),
    #[error("circular dependency: {cycle}")]
    CircularDependency { cycle: String },
    #[error("conflicting policies requested: {a} conflicts with {b}")]
    ConflictingPolicies { a: PolicyId, b: PolicyId },
}

/// The outcome of resolving a requested policy set: the full working set
/// (requested policies plus anything pulled in by a gating dependency) in
/// an order where every policy appears after everything it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub order: Vec<PolicyId>,
    /// Policies present in `order` that were not in the original request,
    /// pulled in by a `Required` or non-overridable `Recommended` edge.
    pub auto_included: Vec<PolicyId>,
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Mark {
    InProgress,
    Done,
}

/// Resolve `requested` against the full `catalog`, expanding gating
/// dependencies and ordering the result so every prerequisite runs first.
pub fn resolve(requested: &[PolicyId], catalog: &[Policy]) -> Result<ResolvedPlan, ResolveError> {
    let by_id: HashMap<&str, &Policy> = catalog
        .iter()
        .map(|p| (p.policy_id.as_str(), p))
        .collect();

    for id in requested {
        if !by_id.contains_key(id.as_str()) {
            return Err(ResolveError::UnknownPolicy(id.clone()));
        }
    }

    let requested_set: HashSet<PolicyId> = requested.iter().cloned().collect();
    let mut working: HashSet<PolicyId> = requested_set.clone();
    let mut queue: VecDeque<PolicyId> = requested.to_vec().into();

    while let Some(id) = queue.pop_front() {
        let policy = by_id[id.as_str()];
        for edge in &policy.dependencies {
            if edge.kind == DependencyKind::Conflict {
                continue;
            }
            if edge.gates_execution() {
                if !by_id.contains_key(edge.other_policy_id.as_str()) {
                    return Err(ResolveError::UnknownPolicy(edge.other_policy_id.clone()));
                }
                if working.insert(edge.other_policy_id.clone()) {
                    queue.push_back(edge.other_policy_id.clone());
                }
            }
        }
    }

    let mut working_sorted: Vec<PolicyId> = working.iter().cloned().collect();
    working_sorted.sort();

    for id in &working_sorted {
        let policy = by_id[id.as_str()];
        for edge in &policy.dependencies {
            if edge.kind == DependencyKind::Conflict && working.contains(&edge.other_policy_id) {
                let mut pair = [id.clone(), edge.other_policy_id.clone()];
                pair.sort();
                return Err(ResolveError::ConflictingPolicies {
                    a: pair[0].clone(),
                    b: pair[1].clone(),
                });
            }
        }
    }

    let mut marks: HashMap<PolicyId, Mark> = HashMap::new();
    let mut path: Vec<PolicyId> = Vec::new();
    let mut order: Vec<PolicyId> = Vec::new();

    for id in &working_sorted {
        visit(id, &by_id, &working, &mut marks, &mut path, &mut order)?;
    }

    let auto_included = order
        .iter()
        .filter(|id| !requested_set.contains(*id))
        .cloned()
        .collect();

    Ok(ResolvedPlan {
        order,
        auto_included,
    })
}

fn visit(
    id: &PolicyId,
    by_id: &HashMap<&str, &Policy>,
    working: &HashSet<PolicyId>,
    marks: &mut HashMap<PolicyId, Mark>,
    path: &mut Vec<PolicyId>,
    order: &mut Vec<PolicyId>,
) -> Result<(), ResolveError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::InProgress) => {
            let start = path.iter().position(|p| p == id).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(id.clone());
            return Err(ResolveError::CircularDependency {
                cycle: cycle.join(" -> "),
            });
        }
        None => {}
    }

    marks.insert(id.clone(), Mark::InProgress);
    path.push(id.clone());

    let policy = by_id[id.as_str()];
    let mut deps: Vec<&PolicyId> = policy
        .dependencies
        .iter()
        .filter(|e| e.gates_execution() && working.contains(&e.other_policy_id))
        .map(|e| &e.other_policy_id)
        .collect();
    deps.sort();

    for dep in deps {
        visit(dep, by_id, working, marks, path, order)?;
    }

    path.pop();
    marks.insert(id.clone(), Mark::Done);
    order.push(id.clone());
    Ok(())
}
