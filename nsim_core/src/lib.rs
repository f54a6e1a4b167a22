//! NSim Core - Discrete-Time Network Simulation Engine
//!
//! Models a population of nodes on a graph, each node carrying a row of
//! named scalar states. A run advances in ticks:
//! 1. **Schemes** pick which nodes are touched and when (activity windows)
//! 2. **Conditions** narrow those nodes by state, degree, utility or chance
//! 3. **Updates** compute new state, utility or topology from the committed
//!    pre-tick buffers, and the engine commits all writes at once

pub mod buffer;
pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod initial;
pub mod model;
pub mod network;
pub mod scheme;
pub mod snapshot;
pub mod state;
pub mod update;
pub mod view;

// Re-export key types for convenience
pub use condition::{Condition, ConditionKind, ConditionTest, ThresholdOperator};
pub use config::{ModelConfig, RetentionPolicy};
pub use context::{derive_seed, seeded_rng, InitContext, SampleContext, SimRng, UpdateContext};
pub use error::{NsimError, Result};
pub use initial::{InitialState, InitialValue};
pub use model::Model;
pub use network::Network;
pub use scheme::Scheme;
pub use snapshot::{parse_snapshots, read_snapshot_file, Snapshot, SnapshotFile, SnapshotWriter};
pub use state::{Constants, StateMap};
pub use update::{
    NetworkOp, NodeAddition, StateChanges, StateValues, Update, UpdateOutput, UpdateTarget,
    UtilityValues,
};
pub use view::ModelView;
