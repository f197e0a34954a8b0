//! Graph validation — run this before persisting or scheduling a workflow.
//!
//! Rules enforced:
//! 1. Step ids must be unique across the whole workflow, nested children
//!    included.
//! 2. Nested child steps must not declare dependencies (gating happens only
//!    at the top level).
//! 3. Every dependency must reference a top-level step id.
//! 4. The dependency graph must be acyclic.
//!
//! Pure function of the definition: no side effects, same input always
//! yields the same verdict.

use std::collections::{HashMap, HashSet};

use crate::models::{Workflow, WorkflowStep};
use crate::EngineError;

/// Validate the workflow's step graph.
///
/// # Errors
/// - [`EngineError::DuplicateStepId`] if two steps share an id.
/// - [`EngineError::NestedDependencies`] if a child step declares deps.
/// - [`EngineError::DanglingDependency`] if a dep names a missing step.
/// - [`EngineError::CycleDetected`] naming the steps on the cycle.
pub fn validate(workflow: &Workflow) -> Result<(), EngineError> {
    // -----------------------------------------------------------------------
    // 1/2. Unique ids everywhere; no dependencies below the top level.
    // -----------------------------------------------------------------------
    let mut seen: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        check_tree(step, true, &mut seen)?;
    }

    let top_level: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    // -----------------------------------------------------------------------
    // 3. Dependency references must resolve to top-level steps.
    // -----------------------------------------------------------------------
    for step in &workflow.steps {
        for dep in &step.dependencies {
            if !top_level.contains(dep.as_str()) {
                return Err(EngineError::DanglingDependency {
                    step_id: step.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // 4. Cycle detection: DFS over dependency edges with an in-progress
    //    stack. Revisiting a step still on the stack is a back-edge.
    // -----------------------------------------------------------------------
    let deps: HashMap<&str, &[String]> = workflow
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut on_stack: HashSet<&str> = HashSet::new();

    for step in &workflow.steps {
        if let Some(cycle) =
            find_cycle(step.id.as_str(), &deps, &mut visited, &mut stack, &mut on_stack)
        {
            return Err(EngineError::CycleDetected { steps: cycle });
        }
    }

    Ok(())
}

/// Walk a step subtree checking id uniqueness and the nested-dependency rule.
fn check_tree<'a>(
    step: &'a WorkflowStep,
    top_level: bool,
    seen: &mut HashSet<&'a str>,
) -> Result<(), EngineError> {
    if !seen.insert(step.id.as_str()) {
        return Err(EngineError::DuplicateStepId(step.id.clone()));
    }
    if !top_level && !step.dependencies.is_empty() {
        return Err(EngineError::NestedDependencies {
            step_id: step.id.clone(),
        });
    }
    for child in step.children() {
        check_tree(child, false, seen)?;
    }
    Ok(())
}

/// DFS from `id`; returns the cycle path if one is reachable.
fn find_cycle<'a>(
    id: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashSet<&'a str>,
    stack: &mut Vec<&'a str>,
    on_stack: &mut HashSet<&'a str>,
) -> Option<Vec<String>> {
    if on_stack.contains(id) {
        // Close the loop: everything from the first occurrence onward.
        let start = stack.iter().position(|s| *s == id).unwrap_or(0);
        let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
        cycle.push(id.to_string());
        return Some(cycle);
    }
    if visited.contains(id) {
        return None;
    }

    visited.insert(id);
    stack.push(id);
    on_stack.insert(id);

    if let Some(step_deps) = deps.get(id) {
        for dep in step_deps.iter() {
            if let Some(cycle) = find_cycle(dep.as_str(), deps, visited, stack, on_stack) {
                return Some(cycle);
            }
        }
    }

    stack.pop();
    on_stack.remove(id);
    None
}
