//! Dependency graph validation and topological ordering.
//!
//! Steps are addressed by their declaration index internally, which makes
//! "declaration order" the natural tie-break for every ordering decision.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use super::spec::{Step, StepDependency};
use crate::errors::GraphError;

/// Step names in an order where every step follows all of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopologicalOrder(Vec<String>);

impl TopologicalOrder {
    /// The ordered names.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Position of `step` in the order.
    #[must_use]
    pub fn position(&self, step: &str) -> Option<usize> {
        self.0.iter().position(|name| name == step)
    }

    /// Iterates the names in order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the order is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the order.
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// Adjacency lists over step declaration indices.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    /// `deps[i]`: what step `i` depends on, ascending.
    deps: Vec<Vec<usize>>,
    /// `dependents[i]`: steps that depend on `i`, ascending.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Indexes steps and edges, rejecting structural problems.
    ///
    /// Cycles are not detected here; see [`DependencyGraph::topological_order`].
    ///
    /// # Errors
    ///
    /// Returns the first structural [`GraphError`] in declaration order.
    pub fn build(steps: &[Step], dependencies: &[StepDependency]) -> Result<Self, GraphError> {
        if steps.is_empty() {
            return Err(GraphError::EmptyPipeline);
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (idx, step) in steps.iter().enumerate() {
            step.validate()?;
            if index.insert(step.name.clone(), idx).is_some() {
                return Err(GraphError::DuplicateStep {
                    step: step.name.clone(),
                });
            }
        }

        let mut deps = vec![Vec::new(); steps.len()];
        let mut dependents = vec![Vec::new(); steps.len()];
        let mut seen = HashSet::with_capacity(dependencies.len());

        for edge in dependencies {
            let Some(&from) = index.get(&edge.step) else {
                return Err(GraphError::UnknownStep {
                    step: edge.step.clone(),
                });
            };
            let Some(&to) = index.get(&edge.depends_on) else {
                return Err(GraphError::DanglingDependency {
                    step: edge.step.clone(),
                    missing_dependency: edge.depends_on.clone(),
                });
            };
            if !seen.insert((from, to)) {
                return Err(GraphError::DuplicateDependency {
                    step: edge.step.clone(),
                    depends_on: edge.depends_on.clone(),
                });
            }
            deps[from].push(to);
            dependents[to].push(from);
        }

        for list in deps.iter_mut().chain(dependents.iter_mut()) {
            list.sort_unstable();
        }

        Ok(Self {
            names: steps.iter().map(|s| s.name.clone()).collect(),
            index,
            deps,
            dependents,
        })
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if the graph has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Declaration index of `name`.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Name of the step at `idx`.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    #[must_use]
    pub fn name(&self, idx: usize) -> &str {
        &self.names[idx]
    }

    /// Step names in declaration order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Direct dependencies of `idx`, ascending.
    #[must_use]
    pub fn dependencies(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    /// Direct dependents of `idx`, ascending.
    #[must_use]
    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Every step reachable downstream of `idx`, ascending, excluding `idx`.
    #[must_use]
    pub fn transitive_dependents(&self, idx: usize) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.dependents[idx].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if next != idx && seen.insert(next) {
                queue.extend(self.dependents[next].iter().copied());
            }
        }
        seen.into_iter().collect()
    }

    /// Kahn's algorithm with a declaration-ordered ready set.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CycleDetected`] naming the steps that sit on a
    /// cycle (or between cycles). Steps that are only downstream of a cycle
    /// are left out of the report.
    pub fn topological_order(&self) -> Result<TopologicalOrder, GraphError> {
        let mut in_degree: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &self.dependents[next] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() == self.len() {
            return Ok(TopologicalOrder(
                order.into_iter().map(|i| self.names[i].clone()).collect(),
            ));
        }

        Err(GraphError::CycleDetected {
            involved_steps: self.cycle_members(&in_degree),
        })
    }

    /// Strips nodes with no remaining dependents until only cycle members
    /// (and paths between cycles) are left.
    fn cycle_members(&self, in_degree: &[usize]) -> Vec<String> {
        let mut remaining: BTreeSet<usize> =
            (0..self.len()).filter(|&i| in_degree[i] > 0).collect();

        loop {
            let leaves: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| !self.dependents[i].iter().any(|d| remaining.contains(d)))
                .collect();
            if leaves.is_empty() {
                break;
            }
            for leaf in leaves {
                remaining.remove(&leaf);
            }
        }

        remaining.into_iter().map(|i| self.names[i].clone()).collect()
    }
}

/// Validates steps and edges and returns a deterministic execution order.
///
/// Among steps whose dependencies are satisfied, earlier-declared steps come
/// first. The function is pure and may be called at any time.
///
/// # Errors
///
/// Returns the first [`GraphError`] found.
pub fn validate(
    steps: &[Step],
    dependencies: &[StepDependency],
) -> Result<TopologicalOrder, GraphError> {
    DependencyGraph::build(steps, dependencies)?.topological_order()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn steps(names: &[&str]) -> Vec<Step> {
        names.iter().map(|n| Step::new(*n, "true")).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<StepDependency> {
        pairs.iter().map(|(s, d)| StepDependency::new(*s, *d)).collect()
    }

    fn order(names: &[&str], pairs: &[(&str, &str)]) -> Vec<String> {
        validate(&steps(names), &edges(pairs)).unwrap().into_vec()
    }

    #[test]
    fn test_linear_chain() {
        assert_eq!(
            order(&["a", "b", "c"], &[("c", "b"), ("b", "a")]),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        assert_eq!(order(&["z", "y", "x"], &[]), vec!["z", "y", "x"]);
        assert_eq!(
            order(&["c", "a", "b"], &[("c", "a")]),
            vec!["a", "c", "b"]
        );
    }

    #[test]
    fn test_diamond() {
        let result = order(
            &["root", "left", "right", "join"],
            &[
                ("left", "root"),
                ("right", "root"),
                ("join", "left"),
                ("join", "right"),
            ],
        );
        assert_eq!(result, vec!["root", "left", "right", "join"]);
    }

    #[test]
    fn test_every_step_after_its_dependencies() {
        let names = ["f", "e", "d", "c", "b", "a"];
        let pairs = [("f", "a"), ("e", "f"), ("d", "b"), ("c", "d"), ("c", "e"), ("b", "a")];
        let result = validate(&steps(&names), &edges(&pairs)).unwrap();
        for (step, dep) in pairs {
            assert!(result.position(dep) < result.position(step), "{dep} before {step}");
        }
        assert_eq!(result.len(), names.len());
    }

    #[test]
    fn test_cycle_reports_members_only() {
        let err = validate(
            &steps(&["a", "b", "c", "d"]),
            &edges(&[("a", "b"), ("b", "c"), ("c", "a"), ("d", "c")]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected {
                involved_steps: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = validate(&steps(&["a", "b"]), &edges(&[("a", "a")])).unwrap_err();
        assert_eq!(
            err,
            GraphError::CycleDetected {
                involved_steps: vec!["a".into()]
            }
        );
    }

    #[test]
    fn test_dangling_dependency() {
        let err = validate(&steps(&["a", "b"]), &edges(&[("b", "ghost")])).unwrap_err();
        assert_eq!(
            err,
            GraphError::DanglingDependency {
                step: "b".into(),
                missing_dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_unknown_dependent_step() {
        let err = validate(&steps(&["a"]), &edges(&[("ghost", "a")])).unwrap_err();
        assert_eq!(err, GraphError::UnknownStep { step: "ghost".into() });
    }

    #[test]
    fn test_duplicate_edge_and_step() {
        let err = validate(&steps(&["a", "b"]), &edges(&[("b", "a"), ("b", "a")])).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateDependency { .. }));

        let err = validate(&steps(&["a", "a"]), &[]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateStep { step: "a".into() });
    }

    #[test]
    fn test_empty_pipeline() {
        assert_eq!(validate(&[], &[]).unwrap_err(), GraphError::EmptyPipeline);
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::build(
            &steps(&["a", "b", "c", "d"]),
            &edges(&[("b", "a"), ("c", "b"), ("d", "a")]),
        )
        .unwrap();
        assert_eq!(graph.transitive_dependents(0), vec![1, 2, 3]);
        assert_eq!(graph.transitive_dependents(1), vec![2]);
        assert!(graph.transitive_dependents(2).is_empty());
    }
}
