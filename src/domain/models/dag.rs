//! Task dependency graph.
//!
//! Validates workflow structure up front (unknown dependencies, duplicate
//! ids, cycles) and answers the scheduling questions the engine asks:
//! which tasks are initially ready, which become ready after a success,
//! and which descendants to skip after a failure.

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use super::task::TaskDescriptor;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("duplicate task id {0:?}")]
    DuplicateTask(String),
    #[error("task {task:?} depends on unknown task {dependency:?}")]
    UnknownDependency { task: String, dependency: String },
    #[error("cycle detected in task dependencies")]
    CycleDetected,
}

/// A node in the dependency graph.
#[derive(Debug, Clone)]
struct DagNode {
    dependencies: Vec<String>,
    dependents: Vec<String>,
}

/// A validated task DAG.
///
/// `order` preserves definition order; ties among ready tasks are broken
/// FIFO against it.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    nodes: HashMap<String, DagNode>,
    order: Vec<String>,
}

impl WorkflowDag {
    /// Build and validate a DAG from task descriptors.
    pub fn build(tasks: &[TaskDescriptor]) -> Result<Self, DagError> {
        let mut nodes: HashMap<String, DagNode> = HashMap::new();
        let mut order = Vec::with_capacity(tasks.len());

        for task in tasks {
            if nodes
                .insert(
                    task.id.clone(),
                    DagNode { dependencies: task.depends_on.clone(), dependents: Vec::new() },
                )
                .is_some()
            {
                return Err(DagError::DuplicateTask(task.id.clone()));
            }
            order.push(task.id.clone());
        }

        // Wire dependents and reject references to undefined tasks.
        for task in tasks {
            for dep in &task.depends_on {
                if !nodes.contains_key(dep) {
                    return Err(DagError::UnknownDependency {
                        task: task.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        for task in tasks {
            for dep in &task.depends_on {
                if let Some(node) = nodes.get_mut(dep) {
                    node.dependents.push(task.id.clone());
                }
            }
        }

        let dag = Self { nodes, order };
        if dag.has_cycle() {
            return Err(DagError::CycleDetected);
        }
        Ok(dag)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Task ids in definition order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(|n| n.dependencies.as_slice()).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.nodes.get(id).map(|n| n.dependents.as_slice()).unwrap_or(&[])
    }

    /// Tasks with no predecessors, in definition order.
    pub fn roots(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.dependencies(id).is_empty())
            .cloned()
            .collect()
    }

    /// Dependents of `id` whose predecessors are all in `succeeded`, in
    /// definition order.
    pub fn newly_ready(&self, id: &str, succeeded: &HashSet<String>) -> Vec<String> {
        let direct: HashSet<&String> = self.dependents(id).iter().collect();
        self.order
            .iter()
            .filter(|candidate| {
                direct.contains(candidate)
                    && self.dependencies(candidate).iter().all(|d| succeeded.contains(d))
            })
            .cloned()
            .collect()
    }

    /// All transitive dependents of `id`.
    pub fn all_dependents(&self, id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut queue: VecDeque<String> = self.dependents(id).iter().cloned().collect();
        while let Some(next) = queue.pop_front() {
            if result.insert(next.clone()) {
                queue.extend(self.dependents(&next).iter().cloned());
            }
        }
        result
    }

    fn has_cycle(&self) -> bool {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        self.order
            .iter()
            .any(|id| self.cycle_dfs(id, &mut visited, &mut stack))
    }

    fn cycle_dfs<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> bool {
        if stack.contains(id) {
            return true;
        }
        if !visited.insert(id) {
            return false;
        }
        stack.insert(id);
        let looped = self
            .dependencies(id)
            .iter()
            .any(|dep| self.cycle_dfs(dep, visited, stack));
        stack.remove(id);
        looped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> TaskDescriptor {
        let mut t = TaskDescriptor::new(id, "noop");
        t.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        t
    }

    #[test]
    fn test_linear_chain() {
        let dag = WorkflowDag::build(&[task("a", &[]), task("b", &["a"]), task("c", &["b"])])
            .unwrap();
        assert_eq!(dag.roots(), vec!["a"]);
        assert_eq!(dag.dependents("a"), &["b"]);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let err = WorkflowDag::build(&[task("a", &["c"]), task("b", &["a"]), task("c", &["b"])])
            .unwrap_err();
        assert_eq!(err, DagError::CycleDetected);
    }

    #[test]
    fn test_self_cycle() {
        let err = WorkflowDag::build(&[task("a", &["a"])]).unwrap_err();
        assert_eq!(err, DagError::CycleDetected);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = WorkflowDag::build(&[task("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));
    }

    #[test]
    fn test_duplicate_id() {
        let err = WorkflowDag::build(&[task("a", &[]), task("a", &[])]).unwrap_err();
        assert_eq!(err, DagError::DuplicateTask("a".to_string()));
    }

    #[test]
    fn test_newly_ready_waits_for_all_predecessors() {
        let dag = WorkflowDag::build(&[
            task("a", &[]),
            task("b", &[]),
            task("c", &["a", "b"]),
        ])
        .unwrap();

        let mut succeeded = HashSet::new();
        succeeded.insert("a".to_string());
        assert!(dag.newly_ready("a", &succeeded).is_empty());

        succeeded.insert("b".to_string());
        assert_eq!(dag.newly_ready("b", &succeeded), vec!["c"]);
    }

    #[test]
    fn test_all_dependents_is_transitive() {
        let dag = WorkflowDag::build(&[
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ])
        .unwrap();

        let skipped = dag.all_dependents("a");
        assert!(skipped.contains("b"));
        assert!(skipped.contains("c"));
        assert!(!skipped.contains("d"));
    }
}
