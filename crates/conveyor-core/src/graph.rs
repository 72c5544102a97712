//! Stack dependency graph.
//!
//! Resolves the deploy order of a set of stacks from their `depends_on`
//! edges. Pure functions over the definitions; independent stacks keep their
//! declaration order so the same input always yields the same order.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::stack::StackDefinition;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle: {}", format_cycle(.members))]
    Cycle { members: Vec<String> },

    #[error("stack '{stack}' depends on unknown stack '{dependency}'")]
    UnresolvedDependency { stack: String, dependency: String },

    #[error("stack '{0}' is defined more than once")]
    DuplicateStack(String),
}

fn format_cycle(members: &[String]) -> String {
    let mut path = members.join(" -> ");
    if let Some(first) = members.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order `stacks` so that every stack comes after all of its dependencies.
///
/// Among the stacks whose dependencies are all placed, the one declared
/// first goes next.
pub fn resolve_order(stacks: &[StackDefinition]) -> Result<Vec<StackDefinition>, GraphError> {
    let mut by_name: HashMap<&str, &StackDefinition> = HashMap::new();
    for stack in stacks {
        if by_name.insert(stack.name.as_str(), stack).is_some() {
            return Err(GraphError::DuplicateStack(stack.name.clone()));
        }
    }

    for stack in stacks {
        for dep in &stack.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(GraphError::UnresolvedDependency {
                    stack: stack.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut placed: HashSet<&str> = HashSet::with_capacity(stacks.len());
    let mut order: Vec<StackDefinition> = Vec::with_capacity(stacks.len());

    while order.len() < stacks.len() {
        let next = stacks.iter().find(|s| {
            !placed.contains(s.name.as_str())
                && s.depends_on.iter().all(|d| placed.contains(d.as_str()))
        });
        let Some(stack) = next else {
            return Err(find_cycle(stacks, &by_name, &placed));
        };
        placed.insert(stack.name.as_str());
        order.push(stack.clone());
    }

    Ok(order)
}

/// Name the members of a cycle among the stacks that could not be placed.
fn find_cycle<'a>(
    stacks: &'a [StackDefinition],
    by_name: &HashMap<&'a str, &'a StackDefinition>,
    placed: &HashSet<&'a str>,
) -> GraphError {
    let mut marks: HashMap<&str, Mark> = placed.iter().map(|n| (*n, Mark::Done)).collect();
    let mut path: Vec<&str> = Vec::new();

    for stack in stacks {
        if let Some(members) = visit(&stack.name, by_name, &mut marks, &mut path) {
            return GraphError::Cycle { members };
        }
    }
    // Every leftover stack waits on another leftover, so a cycle exists.
    GraphError::Cycle {
        members: stacks
            .iter()
            .filter(|s| !placed.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect(),
    }
}

fn visit<'a>(
    name: &'a str,
    by_name: &HashMap<&'a str, &'a StackDefinition>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(name) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            return Some(path[start..].iter().map(|n| n.to_string()).collect());
        }
        None => {}
    }

    let stack = by_name.get(name).copied()?;
    marks.insert(name, Mark::Visiting);
    path.push(name);

    for dep in &stack.depends_on {
        if let Some(members) = visit(dep.as_str(), by_name, marks, path) {
            return Some(members);
        }
    }

    path.pop();
    marks.insert(name, Mark::Done);
    None
}

/// Group an already resolved order into waves of stacks at the same depth.
///
/// A stack's depth is one more than the deepest of its dependencies; stacks
/// without dependencies are in the first wave.
pub fn waves(order: &[StackDefinition]) -> Vec<Vec<StackDefinition>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<StackDefinition>> = Vec::new();

    for stack in order {
        let level = stack
            .depends_on
            .iter()
            .filter_map(|d| depth.get(d.as_str()))
            .map(|d| d + 1)
            .max()
            .unwrap_or(0);
        depth.insert(stack.name.as_str(), level);
        if waves.len() <= level {
            waves.resize_with(level + 1, Vec::new);
        }
        waves[level].push(stack.clone());
    }

    waves
}

/// Whether `order` names every stack exactly once with dependencies first.
pub fn is_valid_order(stacks: &[StackDefinition], order: &[&str]) -> bool {
    if order.len() != stacks.len() {
        return false;
    }

    let by_name: HashMap<&str, &StackDefinition> =
        stacks.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut deployed: HashSet<&str> = HashSet::new();

    for name in order {
        let Some(stack) = by_name.get(name) else {
            return false;
        };
        if !stack.depends_on.iter().all(|d| deployed.contains(d.as_str())) {
            return false;
        }
        if !deployed.insert(*name) {
            return false;
        }
    }
    true
}

/// Every stack that transitively depends on `name`.
pub fn dependents_of<'a>(stacks: &'a [StackDefinition], name: &str) -> Vec<&'a str> {
    let mut found: Vec<&str> = Vec::new();
    let mut frontier = vec![name.to_string()];
    while let Some(current) = frontier.pop() {
        for stack in stacks {
            if stack.depends_on(&current) && !found.contains(&stack.name.as_str()) {
                found.push(stack.name.as_str());
                frontier.push(stack.name.clone());
            }
        }
    }
    found
}
