//! Write-side shadow buffers of a tick.
//!
//! State and utility writes land here immediately (last write wins per
//! cell). Network operations are queued and applied in order at commit,
//! after all same-tick state writes, so every write of the tick is
//! addressed in the pre-tick node numbering.

use crate::error::{NsimError, Result};
use crate::network::Network;
use crate::state::StateMap;
use crate::update::{NetworkOp, NodeAddition, StateChanges, StateValues, UtilityValues};
use nalgebra::DMatrix;
use std::collections::HashSet;
use tracing::debug;

/// Shadow copy of the mutable model buffers.
#[derive(Debug, Clone)]
pub struct ShadowBuffers {
    pub states: DMatrix<f64>,
    pub utility: Option<DMatrix<f64>>,
    pending: Vec<NetworkOp>,
}

/// Buffers ready to replace the live ones.
#[derive(Debug)]
pub struct Committed {
    pub states: DMatrix<f64>,
    pub utility: Option<DMatrix<f64>>,
    /// New topology, if any network operation ran
    pub network: Option<Network>,
}

impl ShadowBuffers {
    /// Copies the committed buffers.
    pub fn new(states: &DMatrix<f64>, utility: Option<&DMatrix<f64>>) -> Self {
        Self {
            states: states.clone(),
            utility: utility.cloned(),
            pending: Vec::new(),
        }
    }

    /// Writes state values for the effective node subset.
    pub fn apply_states(
        &mut self,
        state_map: &StateMap,
        nodes: &[usize],
        changes: &StateChanges,
    ) -> Result<()> {
        let n = self.states.nrows();
        for (name, values) in changes.iter() {
            let col = output_column(state_map, name)?;
            match values {
                StateValues::Aligned(values) => {
                    if values.len() != nodes.len() {
                        return Err(NsimError::execution(format!(
                            "State '{}' got {} values for {} nodes",
                            name,
                            values.len(),
                            nodes.len()
                        )));
                    }
                    for (&node, &value) in nodes.iter().zip(values) {
                        self.states[(node, col)] = value;
                    }
                }
                StateValues::ByNode(values) => {
                    for (&node, &value) in values {
                        if node >= n {
                            return Err(NsimError::execution(format!(
                                "State '{}' written for unknown node {}",
                                name, node
                            )));
                        }
                        self.states[(node, col)] = value;
                    }
                }
                StateValues::Uniform(value) => {
                    for &node in nodes {
                        self.states[(node, col)] = *value;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes utility values for the effective node subset.
    pub fn apply_utility(&mut self, nodes: &[usize], values: &UtilityValues) -> Result<()> {
        let utility = self
            .utility
            .as_mut()
            .ok_or_else(|| NsimError::configuration("Utility is not enabled for this model"))?;
        let n = utility.nrows();
        match values {
            UtilityValues::Rows(rows) => {
                if rows.nrows() != nodes.len() || rows.ncols() != n {
                    return Err(NsimError::execution(format!(
                        "Utility block is {}x{}, expected {}x{}",
                        rows.nrows(),
                        rows.ncols(),
                        nodes.len(),
                        n
                    )));
                }
                for (i, &node) in nodes.iter().enumerate() {
                    utility.set_row(node, &rows.row(i));
                }
            }
            UtilityValues::Entries(entries) => {
                for &(from, to, value) in entries {
                    if from >= n || to >= n {
                        return Err(NsimError::execution(format!(
                            "Utility entry ({}, {}) out of range",
                            from, to
                        )));
                    }
                    utility[(from, to)] = value;
                }
            }
        }
        Ok(())
    }

    /// Queues topology operations for commit.
    pub fn queue_network(&mut self, ops: Vec<NetworkOp>) {
        self.pending.extend(ops);
    }

    /// Applies queued network operations and hands back the buffers to commit.
    pub fn commit(self, state_map: &StateMap, network: &Network) -> Result<Committed> {
        let ShadowBuffers {
            mut states,
            mut utility,
            pending,
        } = self;

        if pending.is_empty() {
            return Ok(Committed {
                states,
                utility,
                network: None,
            });
        }

        let mut network = network.clone();
        let mut changed = false;
        for op in pending {
            match op {
                NetworkOp::Remove(ids) => {
                    remove_nodes(&mut states, &mut utility, &mut network, &ids)?;
                    changed = true;
                }
                NetworkOp::Add(addition) => {
                    add_nodes(&mut states, &mut utility, &mut network, state_map, &addition)?;
                    changed = true;
                }
                NetworkOp::EdgeChange(adjacency) => {
                    let n = network.node_count();
                    if adjacency.nrows() == n && adjacency.ncols() == n {
                        network = Network::from_adjacency(&adjacency);
                        changed = true;
                    } else {
                        debug!(
                            "Ignoring edge_change: got {}x{} adjacency for {} nodes",
                            adjacency.nrows(),
                            adjacency.ncols(),
                            n
                        );
                    }
                }
            }
        }

        Ok(Committed {
            states,
            utility,
            network: changed.then_some(network),
        })
    }
}

fn output_column(state_map: &StateMap, name: &str) -> Result<usize> {
    state_map
        .index_of(name)
        .map_err(|_| NsimError::execution(format!("Output names unknown state '{}'", name)))
}

fn remove_nodes(
    states: &mut DMatrix<f64>,
    utility: &mut Option<DMatrix<f64>>,
    network: &mut Network,
    ids: &[usize],
) -> Result<()> {
    let n = states.nrows();
    if let Some(&bad) = ids.iter().find(|&&id| id >= n) {
        return Err(NsimError::execution(format!(
            "Cannot remove node {} ({} nodes)",
            bad, n
        )));
    }
    let removed: HashSet<usize> = ids.iter().copied().collect();
    let keep: Vec<usize> = (0..n).filter(|i| !removed.contains(i)).collect();

    let old = &*states;
    let kept_states = DMatrix::from_fn(keep.len(), old.ncols(), |r, c| old[(keep[r], c)]);
    *states = kept_states;

    if let Some(u) = utility.as_mut() {
        let old = &*u;
        let kept = DMatrix::from_fn(keep.len(), keep.len(), |r, c| old[(keep[r], keep[c])]);
        *u = kept;
    }

    *network = network.without_nodes(ids);
    Ok(())
}

fn add_nodes(
    states: &mut DMatrix<f64>,
    utility: &mut Option<DMatrix<f64>>,
    network: &mut Network,
    state_map: &StateMap,
    addition: &NodeAddition,
) -> Result<()> {
    let n = states.nrows();
    let count = addition.count;
    let total = n + count;

    if !addition.states.is_empty() && addition.states.len() != count {
        return Err(NsimError::execution(format!(
            "Adding {} nodes but {} initial states were given",
            count,
            addition.states.len()
        )));
    }
    if let Some(&(a, b)) = addition.edges.iter().find(|(a, b)| *a >= total || *b >= total) {
        return Err(NsimError::execution(format!(
            "Edge ({}, {}) out of range after adding nodes ({} nodes)",
            a, b, total
        )));
    }

    let mut grown = states.clone().resize_vertically(total, 0.0);
    for (offset, values) in addition.states.iter().enumerate() {
        for (name, &value) in values {
            let col = output_column(state_map, name)?;
            grown[(n + offset, col)] = value;
        }
    }
    *states = grown;

    match (utility.as_mut(), &addition.utility) {
        (Some(u), rows) => {
            let mut grown = u.clone().resize(total, total, 0.0);
            if let Some(rows) = rows {
                if rows.nrows() != count || rows.ncols() != total {
                    return Err(NsimError::execution(format!(
                        "New utility rows are {}x{}, expected {}x{}",
                        rows.nrows(),
                        rows.ncols(),
                        count,
                        total
                    )));
                }
                for i in 0..count {
                    grown.set_row(n + i, &rows.row(i));
                }
            }
            *u = grown;
        }
        (None, Some(_)) => {
            return Err(NsimError::configuration(
                "Utility rows supplied but utility is not enabled",
            ))
        }
        (None, None) => {}
    }

    *network = network.with_added_nodes(count, &addition.edges);
    Ok(())
}
