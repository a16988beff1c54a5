//! Dependency ordering for fixtures and cleanup.

use crate::error::{HarnessError, HarnessResult};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Directed graph where an edge `a -> b` means "`a` depends on `b`".
///
/// Iteration is over sorted names, so orders are deterministic.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: impl Into<String>) {
        self.edges.entry(name.into()).or_default();
    }

    /// Record that `from` depends on `to`. Both become nodes.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) {
        let to = to.into();
        self.add_node(to.clone());
        self.edges.entry(from.into()).or_default().insert(to);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.edges
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.iter().map(String::as_str))
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Every node, dependencies before dependents.
    pub fn order(&self) -> HarnessResult<Vec<String>> {
        let roots: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        self.order_from(&roots)
    }

    /// `roots` and everything they transitively depend on, dependencies
    /// first. Fails with [`HarnessError::CircularDependency`] on a cycle.
    pub fn order_from(&self, roots: &[&str]) -> HarnessResult<Vec<String>> {
        let mut walk = Walk {
            graph: self,
            visited: HashSet::new(),
            stack: Vec::new(),
            order: Vec::new(),
        };
        for root in roots {
            walk.visit(root)?;
        }
        Ok(walk.order)
    }
}

struct Walk<'g> {
    graph: &'g DependencyGraph,
    visited: HashSet<String>,
    /// Nodes on the current DFS path
    stack: Vec<String>,
    order: Vec<String>,
}

impl Walk<'_> {
    fn visit(&mut self, node: &str) -> HarnessResult<()> {
        if self.visited.contains(node) {
            return Ok(());
        }
        if let Some(start) = self.stack.iter().position(|n| n == node) {
            let mut path = self.stack[start..].to_vec();
            path.push(node.to_string());
            return Err(HarnessError::circular_dependency(node, path));
        }

        self.stack.push(node.to_string());
        let deps: Vec<String> = self.graph.dependencies(node).map(str::to_string).collect();
        for dep in &deps {
            self.visit(dep)?;
        }
        self.stack.pop();

        self.visited.insert(node.to_string());
        self.order.push(node.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_come_first() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("comments", "posts");
        graph.add_edge("posts", "users");
        graph.add_node("tags");
        let order = graph.order().unwrap();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("users") < pos("posts"));
        assert!(pos("posts") < pos("comments"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_order_from_pulls_in_dependencies_only() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("posts", "users");
        graph.add_node("tags");
        assert_eq!(graph.order_from(&["posts"]).unwrap(), vec!["users", "posts"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "c");
        graph.add_edge("c", "a");
        match graph.order() {
            Err(HarnessError::CircularDependency { schema, path }) => {
                assert_eq!(schema, "a");
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_edge_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge("a", "a");
        assert!(matches!(
            graph.order(),
            Err(HarnessError::CircularDependency { .. })
        ));
    }
}
