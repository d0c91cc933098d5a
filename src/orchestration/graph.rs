//! Validated task dependency graph.
//!
//! [`WorkflowGraph::new`] is the only way to build a graph, so every graph in
//! circulation has unique ids, resolvable dependencies and no cycles.
//! Validation order: empty, duplicate ids, unresolved dependencies, cycles.
//! Cycle detection is an iterative DFS whose explicit stack reports the
//! cycle path, e.g. `a -> b -> c -> a`.

use std::collections::{HashMap, HashSet};

use crate::error::WorkflowError;

use super::types::{TaskId, TaskStatus, WorkflowReport, WorkflowTask};

#[derive(Clone, Debug)]
pub struct WorkflowGraph {
    tasks: Vec<WorkflowTask>,
    index: HashMap<TaskId, usize>,
}

impl WorkflowGraph {
    pub fn new(tasks: Vec<WorkflowTask>) -> Result<Self, WorkflowError> {
        if tasks.is_empty() {
            return Err(WorkflowError::Empty);
        }

        let mut tasks = tasks;
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(WorkflowError::DuplicateTaskId {
                    task_id: task.id.clone(),
                });
            }
        }

        for task in &mut tasks {
            let mut seen = HashSet::new();
            task.depends_on.retain(|dep| seen.insert(dep.clone()));
            if let Some(missing) = task.depends_on.iter().find(|d| !index.contains_key(*d)) {
                return Err(WorkflowError::UnresolvedDependency {
                    task_id: task.id.clone(),
                    missing: missing.clone(),
                });
            }
        }

        let graph = Self { tasks, index };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[WorkflowTask] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&WorkflowTask> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Declaration position of `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Direct dependents of `id`, in declaration order.
    pub fn dependents<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a WorkflowTask> + 'a {
        self.tasks
            .iter()
            .filter(move |t| t.depends_on.iter().any(|d| d == id))
    }

    fn check_acyclic(&self) -> Result<(), WorkflowError> {
        let mut visited = HashSet::new();

        for task in &self.tasks {
            if !visited.contains(task.id.as_str()) {
                if let Some(cycle) = self.find_cycle_from(&task.id, &mut visited) {
                    tracing::debug!(cycle = %cycle.join(" -> "), "Dependency cycle detected");
                    return Err(WorkflowError::CyclicDependency { cycle });
                }
            }
        }
        Ok(())
    }

    /// Depth-first walk with an explicit stack of `(task, next dependency)`.
    /// The stack doubles as the current path for cycle reporting.
    fn find_cycle_from<'a>(&'a self, root: &'a str, visited: &mut HashSet<&'a str>) -> Option<Vec<String>> {
        let mut on_stack: HashSet<&'a str> = HashSet::new();
        let mut stack: Vec<(&'a str, usize)> = vec![(root, 0)];
        visited.insert(root);
        on_stack.insert(root);

        while let Some(&(id, next)) = stack.last() {
            let deps = self.get(id).map(|t| t.depends_on.as_slice()).unwrap_or_default();
            let Some(dep) = deps.get(next) else {
                on_stack.remove(id);
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let dep = dep.as_str();

            if on_stack.contains(dep) {
                let start = stack.iter().position(|(p, _)| *p == dep).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|(p, _)| p.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
            if visited.insert(dep) {
                on_stack.insert(dep);
                stack.push((dep, 0));
            }
        }
        None
    }
}

impl WorkflowReport {
    /// A graph of the tasks that did not complete, for a second attempt.
    ///
    /// Dependencies on completed tasks are dropped, since those tasks will not
    /// run again. Their chained context is therefore not re-injected.
    pub fn resubmission(&self, graph: &WorkflowGraph) -> Result<WorkflowGraph, WorkflowError> {
        let completed: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id.as_str())
            .collect();

        let tasks = graph
            .tasks()
            .iter()
            .filter(|t| !completed.contains(t.id.as_str()))
            .map(|t| {
                let mut task = t.clone();
                task.depends_on.retain(|d| !completed.contains(d.as_str()));
                task
            })
            .collect();
        WorkflowGraph::new(tasks)
    }
}
