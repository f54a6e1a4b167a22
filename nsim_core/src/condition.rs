//! Conditions narrow a candidate node set before an update runs.
//!
//! Two tests are built in:
//!
//! - **Threshold**: compares a node's state value, adjacency degree or
//!   utility row against a scalar.
//! - **Stochastic**: keeps each node independently with probability `p`.
//!
//! Conditions chain left to right: the chained condition only sees the
//! nodes the previous link accepted.
//!
//! ```ignore
//! let cond = Condition::stochastic(ConditionKind::State, 0.5)?
//!     .chain(Condition::threshold(ConditionKind::State, ThresholdOperator::Ge, 0.7, Some("A"))?);
//! ```

use crate::context::SimRng;
use crate::error::{NsimError, Result};
use crate::state::StateMap;
use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which model data a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    State,
    Adjacency,
    Utility,
}

/// Comparison used by threshold conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    /// value > threshold
    Gt,
    /// value < threshold
    Lt,
    /// value >= threshold
    Ge,
    /// value <= threshold
    Le,
}

impl ThresholdOperator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            ThresholdOperator::Gt => value > threshold,
            ThresholdOperator::Lt => value < threshold,
            ThresholdOperator::Ge => value >= threshold,
            ThresholdOperator::Le => value <= threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ThresholdOperator::Gt => ">",
            ThresholdOperator::Lt => "<",
            ThresholdOperator::Ge => ">=",
            ThresholdOperator::Le => "<=",
        }
    }
}

impl std::fmt::Display for ThresholdOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl FromStr for ThresholdOperator {
    type Err = NsimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            ">" | "gt" => Ok(ThresholdOperator::Gt),
            "<" | "lt" => Ok(ThresholdOperator::Lt),
            ">=" | "ge" => Ok(ThresholdOperator::Ge),
            "<=" | "le" => Ok(ThresholdOperator::Le),
            _ => Err(NsimError::configuration(format!(
                "Invalid threshold operator: {}",
                s
            ))),
        }
    }
}

/// The test performed by one condition link.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionTest {
    Threshold {
        operator: ThresholdOperator,
        threshold: f64,
        /// State name (required for `ConditionKind::State`)
        state: Option<String>,
        /// Column resolved from `state` at registration
        state_index: Option<usize>,
    },
    Stochastic {
        probability: f64,
    },
}

/// A node filter, optionally followed by further links.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    kind: ConditionKind,
    test: ConditionTest,
    chained: Option<Box<Condition>>,
}

impl Condition {
    /// Creates a threshold condition.
    ///
    /// A `State` kind requires a state name; it is resolved to a column
    /// when the owning update is registered with a model.
    pub fn threshold(
        kind: ConditionKind,
        operator: ThresholdOperator,
        threshold: f64,
        state: Option<&str>,
    ) -> Result<Self> {
        if kind == ConditionKind::State && state.map_or(true, str::is_empty) {
            return Err(NsimError::configuration(
                "A state should be provided when using a state threshold",
            ));
        }
        if threshold.is_nan() {
            return Err(NsimError::configuration("Threshold must not be NaN"));
        }
        Ok(Self {
            kind,
            test: ConditionTest::Threshold {
                operator,
                threshold,
                state: state.map(str::to_string),
                state_index: None,
            },
            chained: None,
        })
    }

    /// Shorthand for a `State` threshold on `state`.
    pub fn state_threshold(
        state: &str,
        operator: ThresholdOperator,
        threshold: f64,
    ) -> Result<Self> {
        Self::threshold(ConditionKind::State, operator, threshold, Some(state))
    }

    /// Creates a stochastic condition keeping each candidate with probability `p`.
    pub fn stochastic(kind: ConditionKind, p: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&p) {
            return Err(NsimError::configuration(format!(
                "Probability must lie in [0, 1], got {}",
                p
            )));
        }
        Ok(Self {
            kind,
            test: ConditionTest::Stochastic { probability: p },
            chained: None,
        })
    }

    /// Appends `next` to the end of this chain.
    pub fn chain(mut self, next: Condition) -> Self {
        match self.chained.take() {
            Some(existing) => self.chained = Some(Box::new(existing.chain(next))),
            None => self.chained = Some(Box::new(next)),
        }
        self
    }

    pub fn kind(&self) -> ConditionKind {
        self.kind
    }

    pub fn test(&self) -> &ConditionTest {
        &self.test
    }

    pub fn chained(&self) -> Option<&Condition> {
        self.chained.as_deref()
    }

    /// Number of links in the chain, including this one.
    pub fn chain_len(&self) -> usize {
        1 + self.chained.as_ref().map_or(0, |c| c.chain_len())
    }

    /// Binds the state column of this link directly.
    pub fn set_state_index(&mut self, index: usize) {
        if let ConditionTest::Threshold { state_index, .. } = &mut self.test {
            *state_index = Some(index);
        }
    }

    /// Resolves state names to columns and checks utility availability,
    /// for every link of the chain.
    pub fn bind(&mut self, state_map: &StateMap, utility_enabled: bool) -> Result<()> {
        if self.kind == ConditionKind::Utility && !utility_enabled {
            return Err(NsimError::configuration(
                "Utility condition used on a model without utility",
            ));
        }
        if let ConditionTest::Threshold {
            state: Some(name),
            state_index,
            ..
        } = &mut self.test
        {
            *state_index = Some(state_map.index_of(name)?);
        }
        match self.chained.as_mut() {
            Some(next) => next.bind(state_map, utility_enabled),
            None => Ok(()),
        }
    }

    /// Filters `nodes`, returning the accepted node ids in candidate order.
    pub fn get_valid_nodes(
        &self,
        nodes: &[usize],
        states: &DMatrix<f64>,
        adjacency: &DMatrix<f64>,
        utility: Option<&DMatrix<f64>>,
        rng: &mut SimRng,
    ) -> Result<Vec<usize>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let selected = match &self.test {
            ConditionTest::Threshold {
                operator,
                threshold,
                state_index,
                ..
            } => self.test_threshold(
                nodes,
                *operator,
                *threshold,
                *state_index,
                states,
                adjacency,
                utility,
            )?,
            ConditionTest::Stochastic { probability } => {
                test_stochastic(nodes, *probability, rng)
            }
        };

        match &self.chained {
            Some(next) => next.get_valid_nodes(&selected, states, adjacency, utility, rng),
            None => Ok(selected),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn test_threshold(
        &self,
        nodes: &[usize],
        operator: ThresholdOperator,
        threshold: f64,
        state_index: Option<usize>,
        states: &DMatrix<f64>,
        adjacency: &DMatrix<f64>,
        utility: Option<&DMatrix<f64>>,
    ) -> Result<Vec<usize>> {
        let mut selected = Vec::with_capacity(nodes.len());
        match self.kind {
            ConditionKind::State => {
                let col = state_index
                    .ok_or_else(|| NsimError::execution("State index has not been set"))?;
                if col >= states.ncols() {
                    return Err(NsimError::execution(format!(
                        "State index {} out of range ({} states)",
                        col,
                        states.ncols()
                    )));
                }
                for &node in nodes {
                    check_row(node, states.nrows())?;
                    if operator.compare(states[(node, col)], threshold) {
                        selected.push(node);
                    }
                }
            }
            ConditionKind::Adjacency => {
                for &node in nodes {
                    check_row(node, adjacency.nrows())?;
                    if operator.compare(adjacency.row(node).sum(), threshold) {
                        selected.push(node);
                    }
                }
            }
            ConditionKind::Utility => {
                let utility = utility.ok_or_else(|| {
                    NsimError::configuration("Utility condition used on a model without utility")
                })?;
                for &node in nodes {
                    check_row(node, utility.nrows())?;
                    if utility
                        .row(node)
                        .iter()
                        .any(|&u| operator.compare(u, threshold))
                    {
                        selected.push(node);
                    }
                }
            }
        }
        Ok(selected)
    }
}

/// One uniform draw per candidate, in candidate order.
fn test_stochastic(nodes: &[usize], probability: f64, rng: &mut SimRng) -> Vec<usize> {
    nodes
        .iter()
        .copied()
        .filter(|_| rng.gen::<f64>() < probability)
        .collect()
}

fn check_row(node: usize, rows: usize) -> Result<()> {
    if node < rows {
        Ok(())
    } else {
        Err(NsimError::execution(format!(
            "Candidate node {} out of range ({} nodes)",
            node, rows
        )))
    }
}
