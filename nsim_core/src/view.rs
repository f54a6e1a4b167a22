//! Read-only view of the committed model buffers.
//!
//! Every update, sampler, condition and property of a tick reads through the
//! same `ModelView`, which borrows the buffers committed at the end of the
//! previous tick. Writes go to separately owned shadow buffers, so a view can
//! never observe a same-tick write.

use crate::error::{NsimError, Result};
use crate::network::Network;
use crate::state::{Constants, StateMap};
use nalgebra::{DMatrix, DVector};

/// Borrowed snapshot of state, adjacency, utility and topology.
#[derive(Debug, Clone, Copy)]
pub struct ModelView<'a> {
    states: &'a DMatrix<f64>,
    adjacency: &'a DMatrix<f64>,
    utility: Option<&'a DMatrix<f64>>,
    network: &'a Network,
    state_map: &'a StateMap,
    constants: &'a Constants,
    iteration: u64,
}

impl<'a> ModelView<'a> {
    pub fn new(
        states: &'a DMatrix<f64>,
        adjacency: &'a DMatrix<f64>,
        utility: Option<&'a DMatrix<f64>>,
        network: &'a Network,
        state_map: &'a StateMap,
        constants: &'a Constants,
        iteration: u64,
    ) -> Self {
        Self {
            states,
            adjacency,
            utility,
            network,
            state_map,
            constants,
            iteration,
        }
    }

    /// Tick currently being computed (or last committed, for properties).
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn node_count(&self) -> usize {
        self.states.nrows()
    }

    /// All node indices.
    pub fn nodes(&self) -> Vec<usize> {
        (0..self.node_count()).collect()
    }

    pub fn constants(&self) -> &'a Constants {
        self.constants
    }

    /// Shorthand for `constants().get(name)`.
    pub fn constant(&self, name: &str) -> Result<f64> {
        self.constants.get(name)
    }

    pub fn state_map(&self) -> &'a StateMap {
        self.state_map
    }

    pub fn get_state_index(&self, name: &str) -> Result<usize> {
        self.state_map.index_of(name)
    }

    /// Column of one state for every node.
    pub fn get_state(&self, name: &str) -> Result<DVector<f64>> {
        let col = self.state_map.index_of(name)?;
        Ok(self.states.column(col).into_owned())
    }

    /// Value of one state for one node.
    pub fn get_node_state(&self, node: usize, name: &str) -> Result<f64> {
        let col = self.state_map.index_of(name)?;
        self.check_node(node)?;
        Ok(self.states[(node, col)])
    }

    /// Full state row of one node.
    pub fn get_node_states(&self, node: usize) -> Result<Vec<f64>> {
        self.check_node(node)?;
        Ok(self.states.row(node).iter().copied().collect())
    }

    /// Values of one state for a list of nodes, in list order.
    pub fn get_nodes_state(&self, nodes: &[usize], name: &str) -> Result<Vec<f64>> {
        let col = self.state_map.index_of(name)?;
        nodes
            .iter()
            .map(|&node| {
                self.check_node(node)?;
                Ok(self.states[(node, col)])
            })
            .collect()
    }

    /// The whole state matrix (nodes x states).
    pub fn get_nodes_states(&self) -> &'a DMatrix<f64> {
        self.states
    }

    pub fn get_adjacency(&self) -> &'a DMatrix<f64> {
        self.adjacency
    }

    pub fn get_neighbors(&self, node: usize) -> Vec<usize> {
        self.network.neighbors(node)
    }

    /// Utility matrix; fails when utility tracking is disabled.
    pub fn get_utility(&self) -> Result<&'a DMatrix<f64>> {
        self.utility
            .ok_or_else(|| NsimError::configuration("Utility is not enabled for this model"))
    }

    /// Utility matrix if tracking is enabled.
    pub fn utility(&self) -> Option<&'a DMatrix<f64>> {
        self.utility
    }

    pub fn network(&self) -> &'a Network {
        self.network
    }

    fn check_node(&self, node: usize) -> Result<()> {
        if node < self.node_count() {
            Ok(())
        } else {
            Err(NsimError::execution(format!(
                "Node {} out of range ({} nodes)",
                node,
                self.node_count()
            )))
        }
    }
}
