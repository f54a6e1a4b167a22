//! Graph topology of the simulated population.
//!
//! Node identities are dense indices `0..N` that double as row indices of
//! the state matrix. Topology edits (removal, insertion, rewiring) always
//! produce a fresh `Network` so that the committed graph is never observed
//! half-modified.

use nalgebra::DMatrix;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

/// Undirected, weighted graph over dense node indices.
#[derive(Debug, Clone, Default)]
pub struct Network {
    graph: UnGraph<(), f64>,
}

impl Network {
    /// Creates a graph of `n` isolated nodes.
    pub fn empty(n: usize) -> Self {
        let mut graph = UnGraph::with_capacity(n, 0);
        for _ in 0..n {
            graph.add_node(());
        }
        Self { graph }
    }

    /// Creates a graph of `n` nodes from an edge list (unit weights).
    ///
    /// Edges with an endpoint outside `0..n` and duplicate edges are ignored.
    pub fn from_edges(n: usize, edges: &[(usize, usize)]) -> Self {
        let mut net = Self::empty(n);
        for &(a, b) in edges {
            net.add_edge(a, b, 1.0);
        }
        net
    }

    /// Builds a graph from an adjacency matrix.
    ///
    /// Every non-zero entry becomes an edge carrying that weight. The
    /// matrix is read as undirected: `(i, j)` and `(j, i)` describe the same
    /// edge, the upper triangle wins when both are set.
    pub fn from_adjacency(adjacency: &DMatrix<f64>) -> Self {
        let n = adjacency.nrows().min(adjacency.ncols());
        let mut net = Self::empty(n);
        for i in 0..n {
            for j in i..n {
                let w = if adjacency[(i, j)] != 0.0 {
                    adjacency[(i, j)]
                } else {
                    adjacency[(j, i)]
                };
                if w != 0.0 {
                    net.graph.add_edge(NodeIndex::new(i), NodeIndex::new(j), w);
                }
            }
        }
        net
    }

    /// Fully connected graph without self loops.
    pub fn complete(n: usize) -> Self {
        let mut net = Self::empty(n);
        for i in 0..n {
            for j in (i + 1)..n {
                net.add_edge(i, j, 1.0);
            }
        }
        net
    }

    /// Ring where every node links to its `k / 2` nearest neighbours on each side.
    pub fn ring_lattice(n: usize, k: usize) -> Self {
        let mut net = Self::empty(n);
        if n < 2 {
            return net;
        }
        for i in 0..n {
            for offset in 1..=(k / 2) {
                net.add_edge(i, (i + offset) % n, 1.0);
            }
        }
        net
    }

    /// Watts-Strogatz small world: a ring lattice whose edges are rewired
    /// with probability `p` to a uniformly chosen new endpoint.
    pub fn watts_strogatz<R: Rng + ?Sized>(n: usize, k: usize, p: f64, rng: &mut R) -> Self {
        let mut net = Self::ring_lattice(n, k);
        if n < 3 {
            return net;
        }
        for offset in 1..=(k / 2) {
            for u in 0..n {
                let v = (u + offset) % n;
                if !rng.gen_bool(p.clamp(0.0, 1.0)) {
                    continue;
                }
                let candidates: Vec<usize> = (0..n)
                    .filter(|&w| w != u && !net.has_edge(u, w))
                    .collect();
                if let Some(&w) = candidates.choose(rng) {
                    net.remove_edge(u, v);
                    net.add_edge(u, w, 1.0);
                }
            }
        }
        net
    }

    /// Erdős-Rényi G(n, p) graph.
    pub fn erdos_renyi<R: Rng + ?Sized>(n: usize, p: f64, rng: &mut R) -> Self {
        let mut net = Self::empty(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if rng.gen_bool(p.clamp(0.0, 1.0)) {
                    net.add_edge(i, j, 1.0);
                }
            }
        }
        net
    }

    /// Random geometric graph in the unit square: nodes closer than `radius` are linked.
    pub fn random_geometric<R: Rng + ?Sized>(n: usize, radius: f64, rng: &mut R) -> Self {
        let positions: Vec<(f64, f64)> = (0..n).map(|_| (rng.gen(), rng.gen())).collect();
        let mut net = Self::empty(n);
        for i in 0..n {
            for j in (i + 1)..n {
                let dx = positions[i].0 - positions[j].0;
                let dy = positions[i].1 - positions[j].1;
                if dx * dx + dy * dy <= radius * radius {
                    net.add_edge(i, j, 1.0);
                }
            }
        }
        net
    }

    /// Adds an edge unless it exists already or an endpoint is out of range.
    pub fn add_edge(&mut self, a: usize, b: usize, weight: f64) -> bool {
        let n = self.node_count();
        if a >= n || b >= n || self.has_edge(a, b) {
            return false;
        }
        self.graph.add_edge(NodeIndex::new(a), NodeIndex::new(b), weight);
        true
    }

    /// Removes the edge between `a` and `b`, if any.
    pub fn remove_edge(&mut self, a: usize, b: usize) -> bool {
        if a >= self.node_count() || b >= self.node_count() {
            return false;
        }
        match self.graph.find_edge(NodeIndex::new(a), NodeIndex::new(b)) {
            Some(edge) => {
                self.graph.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    pub fn has_edge(&self, a: usize, b: usize) -> bool {
        a < self.node_count()
            && b < self.node_count()
            && self.graph.find_edge(NodeIndex::new(a), NodeIndex::new(b)).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All node indices, in order.
    pub fn nodes(&self) -> Vec<usize> {
        (0..self.node_count()).collect()
    }

    /// Sorted neighbour indices of `node` (empty for an unknown node).
    pub fn neighbors(&self, node: usize) -> Vec<usize> {
        if node >= self.node_count() {
            return Vec::new();
        }
        let mut out: Vec<usize> = self
            .graph
            .neighbors(NodeIndex::new(node))
            .map(|n| n.index())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Edge list as `(a, b)` pairs with `a <= b`, sorted.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        let mut out: Vec<(usize, usize)> = self
            .graph
            .edge_references()
            .map(|e| {
                let (a, b) = (e.source().index(), e.target().index());
                (a.min(b), a.max(b))
            })
            .collect();
        out.sort_unstable();
        out
    }

    /// Dense symmetric adjacency matrix holding edge weights.
    pub fn adjacency_matrix(&self) -> DMatrix<f64> {
        let n = self.node_count();
        let mut adjacency = DMatrix::zeros(n, n);
        for edge in self.graph.edge_references() {
            let (a, b) = (edge.source().index(), edge.target().index());
            adjacency[(a, b)] = *edge.weight();
            adjacency[(b, a)] = *edge.weight();
        }
        adjacency
    }

    /// Returns a copy without the `removed` nodes.
    ///
    /// Survivors are renumbered densely, keeping their relative order.
    pub fn without_nodes(&self, removed: &[usize]) -> Self {
        let removed: HashSet<usize> = removed.iter().copied().collect();
        let mut remap = vec![None; self.node_count()];
        let mut next = 0;
        for (old, slot) in remap.iter_mut().enumerate() {
            if !removed.contains(&old) {
                *slot = Some(next);
                next += 1;
            }
        }

        let mut net = Self::empty(next);
        for edge in self.graph.edge_references() {
            let (a, b) = (edge.source().index(), edge.target().index());
            if let (Some(na), Some(nb)) = (remap[a], remap[b]) {
                net.graph.add_edge(NodeIndex::new(na), NodeIndex::new(nb), *edge.weight());
            }
        }
        net
    }

    /// Returns a copy with `count` new nodes appended and `edges` added.
    ///
    /// Edge endpoints refer to the numbering after insertion.
    pub fn with_added_nodes(&self, count: usize, edges: &[(usize, usize)]) -> Self {
        let mut net = self.clone();
        for _ in 0..count {
            net.graph.add_node(());
        }
        for &(a, b) in edges {
            net.add_edge(a, b, 1.0);
        }
        net
    }
}
