//! Updates: named rules that compute new values for a node subset.

use crate::condition::Condition;
use crate::context::UpdateContext;
use crate::error::{NsimError, Result};
use crate::state::Constants;
use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

/// What an update writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    State,
    Utility,
    Network,
}

impl UpdateTarget {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateTarget::State => "state",
            UpdateTarget::Utility => "utility",
            UpdateTarget::Network => "network",
        }
    }
}

/// New values for one state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValues {
    /// One value per node of the effective subset, in subset order
    Aligned(Vec<f64>),
    /// Values keyed by node id
    ByNode(BTreeMap<usize, f64>),
    /// The same value for every node of the subset
    Uniform(f64),
}

impl From<Vec<f64>> for StateValues {
    fn from(values: Vec<f64>) -> Self {
        StateValues::Aligned(values)
    }
}

impl From<DVector<f64>> for StateValues {
    fn from(values: DVector<f64>) -> Self {
        StateValues::Aligned(values.iter().copied().collect())
    }
}

impl From<BTreeMap<usize, f64>> for StateValues {
    fn from(values: BTreeMap<usize, f64>) -> Self {
        StateValues::ByNode(values)
    }
}

impl From<f64> for StateValues {
    fn from(value: f64) -> Self {
        StateValues::Uniform(value)
    }
}

/// Ordered set of state assignments produced by one update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateChanges(Vec<(String, StateValues)>);

impl StateChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an assignment (builder style).
    pub fn set(mut self, state: impl Into<String>, values: impl Into<StateValues>) -> Self {
        self.0.push((state.into(), values.into()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &StateValues)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// New utility values.
#[derive(Debug, Clone, PartialEq)]
pub enum UtilityValues {
    /// One row per node of the effective subset, one column per node of the model
    Rows(DMatrix<f64>),
    /// Individual `(from, to, value)` entries
    Entries(Vec<(usize, usize, f64)>),
}

/// Nodes appended by a `NetworkOp::Add`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeAddition {
    /// Number of nodes to append
    pub count: usize,

    /// Initial states per new node (empty = all zero; missing states are zero)
    pub states: Vec<BTreeMap<String, f64>>,

    /// Utility rows for the new nodes, `count x (N + count)`
    pub utility: Option<DMatrix<f64>>,

    /// Edges to add, in the numbering after insertion
    pub edges: Vec<(usize, usize)>,
}

impl NodeAddition {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    pub fn with_states(mut self, states: Vec<BTreeMap<String, f64>>) -> Self {
        self.states = states;
        self
    }

    pub fn with_utility(mut self, utility: DMatrix<f64>) -> Self {
        self.utility = Some(utility);
        self
    }

    pub fn with_edges(mut self, edges: Vec<(usize, usize)>) -> Self {
        self.edges = edges;
        self
    }
}

/// A topology mutation, applied when the tick commits.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkOp {
    /// Delete nodes (and their state/utility rows)
    Remove(Vec<usize>),
    /// Append nodes
    Add(NodeAddition),
    /// Replace the adjacency matrix; ignored unless the shape matches
    EdgeChange(DMatrix<f64>),
}

impl NetworkOp {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkOp::Remove(_) => "remove",
            NetworkOp::Add(_) => "add",
            NetworkOp::EdgeChange(_) => "edge_change",
        }
    }
}

/// Result of executing an update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutput {
    State(StateChanges),
    Utility(UtilityValues),
    Network(Vec<NetworkOp>),
}

impl UpdateOutput {
    /// Output assigning a single state.
    pub fn state(state: impl Into<String>, values: impl Into<StateValues>) -> Self {
        UpdateOutput::State(StateChanges::new().set(state, values))
    }

    pub fn target(&self) -> UpdateTarget {
        match self {
            UpdateOutput::State(_) => UpdateTarget::State,
            UpdateOutput::Utility(_) => UpdateTarget::Utility,
            UpdateOutput::Network(_) => UpdateTarget::Network,
        }
    }
}

impl From<StateChanges> for UpdateOutput {
    fn from(changes: StateChanges) -> Self {
        UpdateOutput::State(changes)
    }
}

/// User function behind an update.
pub type UpdateFn = Box<dyn Fn(&mut UpdateContext<'_>) -> Result<UpdateOutput>>;

/// A rule run once per active tick of every scheme that holds it.
pub struct Update {
    name: String,
    function: UpdateFn,
    args: Constants,
    condition: Option<Condition>,
    get_nodes: bool,
    target: UpdateTarget,
}

impl Update {
    pub fn new<F>(name: impl Into<String>, target: UpdateTarget, function: F) -> Self
    where
        F: Fn(&mut UpdateContext<'_>) -> Result<UpdateOutput> + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
            args: Constants::new(),
            condition: None,
            get_nodes: false,
            target,
        }
    }

    /// Update writing node states.
    pub fn state<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut UpdateContext<'_>) -> Result<UpdateOutput> + 'static,
    {
        Self::new(name, UpdateTarget::State, function)
    }

    /// Update writing the utility matrix.
    pub fn utility<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut UpdateContext<'_>) -> Result<UpdateOutput> + 'static,
    {
        Self::new(name, UpdateTarget::Utility, function)
    }

    /// Update mutating the topology.
    pub fn network<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut UpdateContext<'_>) -> Result<UpdateOutput> + 'static,
    {
        Self::new(name, UpdateTarget::Network, function)
    }

    /// Guards the update with a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Binds arguments readable through `UpdateContext::arg`.
    pub fn with_args(mut self, args: Constants) -> Self {
        self.args = args;
        self
    }

    /// Passes the effective node subset to the function.
    pub fn with_nodes(mut self) -> Self {
        self.get_nodes = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> UpdateTarget {
        self.target
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    pub(crate) fn condition_mut(&mut self) -> Option<&mut Condition> {
        self.condition.as_mut()
    }

    pub fn args(&self) -> &Constants {
        &self.args
    }

    pub fn get_nodes(&self) -> bool {
        self.get_nodes
    }

    /// Runs the function and checks its output against the declared target.
    pub fn execute(&self, ctx: &mut UpdateContext<'_>) -> Result<UpdateOutput> {
        let output = (self.function)(ctx)?;
        if output.target() != self.target {
            return Err(NsimError::execution(format!(
                "Update '{}' targets {} but produced {} output",
                self.name,
                self.target.name(),
                output.target().name()
            )));
        }
        Ok(output)
    }
}

impl std::fmt::Debug for Update {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Update")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("get_nodes", &self.get_nodes)
            .field("condition", &self.condition)
            .finish()
    }
}
