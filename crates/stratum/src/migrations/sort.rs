//! Dependency-ordered planning
//!
//! Kahn's algorithm with a min-heap keyed on input position, so the plan
//! follows discovery order except where a dependency forces otherwise.
//! The sorter is lazy; an unsatisfiable graph is only detectable once the
//! ready queue drains, so errors surface at the end of iteration.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use crate::error::{MigrateError, MigrateResult};

use super::definitions::{Migration, MigrationList};

/// Lazily yields nodes in dependency order, breaking ties by input
/// position. `graph` maps each node to the nodes that must come first.
pub struct TopologicalSorter<T> {
    by_index: Vec<T>,
    ordering: HashMap<T, usize>,
    graph: HashMap<T, Vec<T>>,
    pqueue: BinaryHeap<Reverse<usize>>,
    output: HashSet<T>,
    blocked_on: HashMap<T, HashSet<T>>,
    blocked: HashSet<T>,
}

impl<T> TopologicalSorter<T>
where
    T: Clone + Eq + Hash + std::fmt::Display,
{
    pub fn new(nodes: Vec<T>, graph: HashMap<T, Vec<T>>) -> Self {
        let ordering: HashMap<T, usize> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.clone(), index))
            .collect();
        let pqueue = (0..nodes.len()).map(Reverse).collect();
        Self {
            by_index: nodes,
            ordering,
            graph,
            pqueue,
            output: HashSet::new(),
            blocked_on: HashMap::new(),
            blocked: HashSet::new(),
        }
    }

    fn dependencies_met(&self, node: &T) -> bool {
        self.graph
            .get(node)
            .map(|deps| deps.iter().all(|dep| self.output.contains(dep)))
            .unwrap_or(true)
    }

    /// Park a node until one of its unmet dependencies is emitted
    fn block(&mut self, node: T) {
        if let Some(deps) = self.graph.get(&node) {
            for dep in deps.clone() {
                if !self.output.contains(&dep) {
                    self.blocked_on.entry(dep).or_default().insert(node.clone());
                }
            }
        }
        self.blocked.insert(node);
    }

    /// Re-queue everything that was waiting on `released`
    fn unblock(&mut self, released: &T) {
        if let Some(waiters) = self.blocked_on.remove(released) {
            for waiter in waiters {
                if self.blocked.remove(&waiter) {
                    self.pqueue.push(Reverse(self.ordering[&waiter]));
                }
            }
        }
    }

    /// The queue drained with nodes still parked. Distinguish an edge to a
    /// node outside the input set from a genuine cycle; the cycle error
    /// lists every unresolved node in input order.
    fn stall_error(&self) -> MigrateError {
        for blocker in self.blocked_on.keys() {
            if !self.ordering.contains_key(blocker) {
                return MigrateError::NonExistentNode(blocker.to_string());
            }
        }
        let mut unresolved: Vec<usize> = self
            .blocked
            .iter()
            .map(|node| self.ordering[node])
            .collect();
        unresolved.sort_unstable();
        MigrateError::Cycle(
            unresolved
                .into_iter()
                .map(|index| self.by_index[index].to_string())
                .collect(),
        )
    }
}

impl<T> Iterator for TopologicalSorter<T>
where
    T: Clone + Eq + Hash + std::fmt::Display,
{
    type Item = MigrateResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(Reverse(index)) = self.pqueue.pop() {
            let candidate = self.by_index[index].clone();
            if self.dependencies_met(&candidate) {
                self.output.insert(candidate.clone());
                self.unblock(&candidate);
                return Some(Ok(candidate));
            }
            self.block(candidate);
        }
        if self.blocked.is_empty() {
            None
        } else {
            let err = self.stall_error();
            self.blocked.clear();
            self.blocked_on.clear();
            Some(Err(err))
        }
    }
}

/// Order migrations so every dependency precedes its dependents, keeping
/// the input order wherever the graph allows it.
pub fn sort_migrations<I>(migrations: I) -> MigrateResult<Vec<Arc<Migration>>>
where
    I: IntoIterator<Item = Arc<Migration>>,
{
    let migrations: Vec<Arc<Migration>> = migrations.into_iter().collect();
    let by_id: HashMap<String, Arc<Migration>> = migrations
        .iter()
        .map(|m| (m.id().to_string(), m.clone()))
        .collect();
    let ids: Vec<String> = migrations.iter().map(|m| m.id().to_string()).collect();

    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for migration in &migrations {
        // dependencies outside the working set are already applied or
        // filtered out upstream; they impose no ordering here
        let deps: Vec<String> = migration
            .depends()
            .iter()
            .filter(|dep| by_id.contains_key(*dep))
            .cloned()
            .collect();
        graph.insert(migration.id().to_string(), deps);
    }

    let mut ordered = Vec::with_capacity(migrations.len());
    for id in TopologicalSorter::new(ids, graph) {
        ordered.push(by_id[&id?].clone());
    }
    Ok(ordered)
}

fn full_graph(list: &MigrationList) -> HashMap<String, Vec<String>> {
    list.iter()
        .map(|m| {
            (
                m.id().to_string(),
                m.depends().iter().cloned().collect::<Vec<_>>(),
            )
        })
        .collect()
}

/// Ids of every migration the given one depends on, directly or not
pub fn ancestors(list: &MigrationList, id: &str) -> HashSet<String> {
    let graph = full_graph(list);
    let mut found = HashSet::new();
    let mut stack = vec![id.to_string()];
    while let Some(current) = stack.pop() {
        if let Some(deps) = graph.get(&current) {
            for dep in deps {
                if found.insert(dep.clone()) {
                    stack.push(dep.clone());
                }
            }
        }
    }
    found
}

/// Ids of every migration that depends on the given one, directly or not
pub fn descendants(list: &MigrationList, id: &str) -> HashSet<String> {
    let graph = full_graph(list);
    let mut reversed: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node, deps) in &graph {
        for dep in deps {
            reversed.entry(dep).or_default().push(node);
        }
    }
    let mut found = HashSet::new();
    let mut stack: Vec<&str> = vec![id];
    while let Some(current) = stack.pop() {
        if let Some(dependents) = reversed.get(current) {
            for dependent in dependents {
                if found.insert(dependent.to_string()) {
                    stack.push(dependent);
                }
            }
        }
    }
    found
}

/// Migrations nothing else depends on
pub fn heads(list: &MigrationList) -> Vec<Arc<Migration>> {
    let mut depended_on: HashSet<&str> = HashSet::new();
    for migration in list {
        depended_on.extend(migration.depends().iter().map(String::as_str));
    }
    list.iter()
        .filter(|m| !depended_on.contains(m.id()))
        .cloned()
        .collect()
}
