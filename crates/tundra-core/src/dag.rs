//! The unit graph.
//!
//! Nodes are canonical unit directories; an edge `D -> U` means `U` waits for
//! `D`. Cycles are a hard error reported with the full cycle path. Destroy
//! traversals walk the same graph against the edge direction.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct Dag {
    graph: DiGraph<PathBuf, ()>,
    index: BTreeMap<PathBuf, NodeIndex>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&mut self, dir: &Path) -> NodeIndex {
        if let Some(ix) = self.index.get(dir) {
            return *ix;
        }
        let ix = self.graph.add_node(dir.to_path_buf());
        self.index.insert(dir.to_path_buf(), ix);
        ix
    }

    /// Record that `dependent` waits for `dependency`.
    pub fn add_edge(&mut self, dependency: &Path, dependent: &Path) {
        let dep = self.add_unit(dependency);
        let unit = self.add_unit(dependent);
        if !self.graph.contains_edge(dep, unit) {
            self.graph.add_edge(dep, unit, ());
        }
    }

    pub fn node(&self, dir: &Path) -> Option<NodeIndex> {
        self.index.get(dir).copied()
    }

    pub fn dir(&self, ix: NodeIndex) -> &PathBuf {
        &self.graph[ix]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn units(&self) -> impl Iterator<Item = &PathBuf> {
        self.index.keys()
    }

    /// Direct dependencies of a unit (upstream nodes).
    pub fn dependencies_of(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(ix, Direction::Incoming)
            .collect()
    }

    /// Direct dependents of a unit (downstream nodes).
    pub fn dependents_of(&self, ix: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(ix, Direction::Outgoing)
            .collect()
    }

    /// Transitive closure in the given direction, excluding the start set.
    pub fn transitive(&self, start: &[NodeIndex], direction: Direction) -> HashSet<NodeIndex> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = start.iter().copied().collect();
        while let Some(ix) = queue.pop_front() {
            for next in self.graph.neighbors_directed(ix, direction) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        for ix in start {
            seen.remove(ix);
        }
        seen
    }

    /// Depth-first cycle check. On a cycle, the error carries the full path
    /// `a -> b -> ... -> a`. Start nodes are visited in path order so the
    /// reported cycle is deterministic.
    pub fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks: HashMap<NodeIndex, Mark> =
            self.graph.node_indices().map(|ix| (ix, Mark::White)).collect();

        for &start in self.index.values() {
            if marks[&start] != Mark::White {
                continue;
            }
            // Iterative DFS keeping the gray path for cycle extraction.
            let mut path: Vec<NodeIndex> = Vec::new();
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
            let mut successors: Vec<NodeIndex> =
                self.graph.neighbors_directed(start, Direction::Outgoing).collect();
            successors.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
            marks.insert(start, Mark::Gray);
            path.push(start);
            stack.push((start, successors));

            while let Some((node, succ)) = stack.last_mut() {
                match succ.pop() {
                    Some(next) => match marks[&next] {
                        Mark::Gray => {
                            let pos = path
                                .iter()
                                .position(|&p| p == next)
                                .expect("gray node must be on the path");
                            let mut cycle: Vec<PathBuf> =
                                path[pos..].iter().map(|&ix| self.graph[ix].clone()).collect();
                            cycle.push(self.graph[next].clone());
                            return Err(Error::Cycle(cycle));
                        }
                        Mark::White => {
                            marks.insert(next, Mark::Gray);
                            path.push(next);
                            let mut nexts: Vec<NodeIndex> = self
                                .graph
                                .neighbors_directed(next, Direction::Outgoing)
                                .collect();
                            nexts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));
                            stack.push((next, nexts));
                        }
                        Mark::Black => {}
                    },
                    None => {
                        marks.insert(*node, Mark::Black);
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }
        Ok(())
    }

    /// Nodes in dependency order (dependencies before dependents), ties broken
    /// by canonical path for reproducible scheduling.
    pub fn topo_order(&self) -> Result<Vec<NodeIndex>> {
        self.check_acyclic()?;
        let mut indegree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|ix| {
                (
                    ix,
                    self.graph.neighbors_directed(ix, Direction::Incoming).count(),
                )
            })
            .collect();
        let mut ready: Vec<NodeIndex> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(ix, _)| *ix)
            .collect();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while !ready.is_empty() {
            ready.sort_by(|a, b| self.graph[*b].cmp(&self.graph[*a]));
            let ix = ready.pop().expect("nonempty ready set");
            order.push(ix);
            for next in self.graph.neighbors_directed(ix, Direction::Outgoing) {
                let d = indegree.get_mut(&next).expect("known node");
                *d -= 1;
                if *d == 0 {
                    ready.push(next);
                }
            }
        }
        Ok(order)
    }

    /// DOT rendering for the `graph` command.
    pub fn to_dot(&self, root: &Path) -> String {
        let mut out = String::from("digraph {\n");
        for ix in self.graph.node_indices() {
            out.push_str(&format!(
                "  \"{}\" ;\n",
                crate::error::display_relative(&self.graph[ix], root)
            ));
        }
        for edge in self.graph.edge_indices() {
            if let Some((a, b)) = self.graph.edge_endpoints(edge) {
                out.push_str(&format!(
                    "  \"{}\" -> \"{}\" ;\n",
                    crate::error::display_relative(&self.graph[b], root),
                    crate::error::display_relative(&self.graph[a], root),
                ));
            }
        }
        out.push_str("}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag(edges: &[(&str, &str)]) -> Dag {
        let mut dag = Dag::new();
        for (dep, unit) in edges {
            dag.add_edge(Path::new(dep), Path::new(unit));
        }
        dag
    }

    #[test]
    fn topo_order_respects_edges_and_is_deterministic() {
        let dag = dag(&[("/r/a", "/r/b"), ("/r/a", "/r/c"), ("/r/b", "/r/d"), ("/r/c", "/r/d")]);
        let order: Vec<&PathBuf> = dag.topo_order().unwrap().into_iter().map(|ix| dag.dir(ix)).collect();
        let pos = |p: &str| order.iter().position(|d| d.as_path() == Path::new(p)).unwrap();
        assert!(pos("/r/a") < pos("/r/b"));
        assert!(pos("/r/a") < pos("/r/c"));
        assert!(pos("/r/b") < pos("/r/d"));
        // Ready ties resolve lexicographically.
        assert!(pos("/r/b") < pos("/r/c"));
    }

    #[test]
    fn cycle_reports_full_path() {
        let dag = dag(&[("/r/a", "/r/b"), ("/r/b", "/r/a")]);
        let err = dag.check_acyclic().unwrap_err();
        match err {
            Error::Cycle(cycle) => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let dag = dag(&[("/r/a", "/r/a")]);
        assert!(matches!(dag.check_acyclic(), Err(Error::Cycle(_))));
    }

    #[test]
    fn transitive_closure_walks_both_directions() {
        let dag = dag(&[("/r/a", "/r/b"), ("/r/b", "/r/c")]);
        let a = dag.node(Path::new("/r/a")).unwrap();
        let c = dag.node(Path::new("/r/c")).unwrap();
        let down = dag.transitive(&[a], Direction::Outgoing);
        assert_eq!(down.len(), 2);
        let up = dag.transitive(&[c], Direction::Incoming);
        assert_eq!(up.len(), 2);
    }

    #[test]
    fn duplicate_edges_collapse() {
        let mut dag = Dag::new();
        dag.add_edge(Path::new("/r/a"), Path::new("/r/b"));
        dag.add_edge(Path::new("/r/a"), Path::new("/r/b"));
        assert_eq!(dag.len(), 2);
        let b = dag.node(Path::new("/r/b")).unwrap();
        assert_eq!(dag.dependencies_of(b).len(), 1);
    }
}
