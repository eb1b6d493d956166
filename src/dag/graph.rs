// src/dag/graph.rs

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Bfs;

use crate::flow::Flow;
use crate::types::JobId;

/// Dependency graph of a validated flow.
///
/// Nodes are declaration indices; an edge `p -> c` means job `c` consumes an
/// output of job `p`. Acyclicity is checked by `Flow::validate`, so this type
/// only keeps adjacency and ordering information.
#[derive(Debug, Clone)]
pub struct DagGraph {
    ids: Vec<JobId>,
    priorities: Vec<i32>,
    index: HashMap<JobId, usize>,
    graph: DiGraphMap<usize, ()>,
}

impl DagGraph {
    /// Build the graph from a flow that already passed validation.
    pub fn from_flow(flow: &Flow) -> Self {
        let jobs = flow.jobs();

        let ids: Vec<JobId> = jobs.iter().map(|j| j.id.clone()).collect();
        let priorities: Vec<i32> = jobs.iter().map(|j| j.priority).collect();
        let index: HashMap<JobId, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut graph = DiGraphMap::new();
        for i in 0..ids.len() {
            graph.add_node(i);
        }
        for (consumer, job) in jobs.iter().enumerate() {
            for producer in job.producers() {
                if let Some(&p) = index.get(&producer) {
                    graph.add_edge(p, consumer, ());
                }
            }
        }

        Self {
            ids,
            priorities,
            index,
            graph,
        }
    }

    /// Job ids in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Sort key for dispatch: higher priority first, then declaration order.
    pub fn dispatch_key(&self, id: &str) -> (Reverse<i32>, usize) {
        match self.index_of(id) {
            Some(i) => (Reverse(self.priorities[i]), i),
            None => (Reverse(i32::MIN), usize::MAX),
        }
    }

    fn neighbors(&self, id: &str, dir: Direction) -> Vec<&str> {
        let Some(i) = self.index_of(id) else {
            return Vec::new();
        };
        let mut out: Vec<usize> = self.graph.neighbors_directed(i, dir).collect();
        out.sort_unstable();
        out.into_iter().map(|n| self.ids[n].as_str()).collect()
    }

    /// Direct producers of `id`.
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct consumers of `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every job reachable from `id`, excluding `id` itself, in declaration
    /// order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let Some(start) = self.index_of(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(n) = bfs.next(&self.graph) {
            if n != start {
                out.push(n);
            }
        }
        out.sort_unstable();
        out.into_iter().map(|n| self.ids[n].as_str()).collect()
    }

    /// Jobs without producers.
    pub fn roots(&self) -> Vec<&str> {
        self.jobs()
            .filter(|id| self.dependencies_of(id).is_empty())
            .collect()
    }

    /// Topological order in which jobs would be submitted if every job
    /// completed instantly: among available jobs, higher priority first,
    /// then declaration order.
    pub fn submission_order(&self) -> Vec<&str> {
        let mut in_degree: Vec<usize> = (0..self.ids.len())
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut heap: BinaryHeap<(i32, Reverse<usize>)> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| (self.priorities[i], Reverse(i)))
            .collect();

        let mut order = Vec::with_capacity(self.ids.len());
        while let Some((_, Reverse(i))) = heap.pop() {
            order.push(self.ids[i].as_str());
            for next in self.graph.neighbors_directed(i, Direction::Outgoing) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    heap.push((self.priorities[next], Reverse(next)));
                }
            }
        }
        order
    }
}
