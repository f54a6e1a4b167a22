//! The iteration engine.
//!
//! A tick runs four phases in order:
//!
//! 1. **Compute**: every active scheme samples its nodes; each of its updates
//!    narrows the sample with its condition, runs against the committed
//!    buffers and writes into shadow buffers.
//! 2. **Assign**: the shadows replace the committed buffers; queued network
//!    operations are applied and the adjacency matrix is rebuilt.
//! 3. **PropertyEval**: properties due at this tick are evaluated.
//! 4. **Advance**: the tick counter moves on.
//!
//! An error anywhere in Compute or Assign discards the shadows, leaving the
//! committed model untouched.

use crate::buffer::ShadowBuffers;
use crate::config::{ModelConfig, RetentionPolicy};
use crate::context::{seeded_rng, InitContext, SampleContext, SimRng, UpdateContext};
use crate::error::{NsimError, Result};
use crate::initial::{InitialState, InitialValue};
use crate::network::Network;
use crate::scheme::Scheme;
use crate::snapshot::{Snapshot, SnapshotWriter};
use crate::state::{Constants, StateMap};
use crate::update::{Update, UpdateOutput, UpdateTarget};
use crate::view::ModelView;
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, warn};

/// Periodic scalar observable of the committed model.
pub type PropertyFn = Box<dyn Fn(&ModelView<'_>) -> Result<f64>>;

struct Property {
    name: String,
    interval: u64,
    function: PropertyFn,
}

/// A discrete-time simulation over a network of nodes.
pub struct Model {
    config: ModelConfig,
    network: Network,
    adjacency: DMatrix<f64>,
    node_states: DMatrix<f64>,
    utility: Option<DMatrix<f64>>,
    state_map: Option<StateMap>,
    constants: Constants,
    schemes: Vec<Scheme>,
    properties: Vec<Property>,
    property_results: BTreeMap<String, Vec<f64>>,
    current_iteration: u64,
    rng: SimRng,
}

impl Model {
    /// Creates a model over `network`.
    ///
    /// The model starts with a single default scheme that samples every
    /// node and is always active; `add_update` registers into it.
    pub fn new(network: Network, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let n = network.node_count();
        let utility = config.utility.then(|| DMatrix::zeros(n, n));
        Ok(Self {
            adjacency: network.adjacency_matrix(),
            node_states: DMatrix::zeros(n, 0),
            utility,
            state_map: None,
            constants: Constants::new(),
            schemes: vec![Scheme::all_nodes("default")],
            properties: Vec::new(),
            property_results: BTreeMap::new(),
            current_iteration: 0,
            rng: seeded_rng(config.seed),
            network,
            config,
        })
    }

    // ------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------

    /// Declares the state columns. Can only be called once.
    pub fn set_states<S: AsRef<str>>(&mut self, names: &[S]) -> Result<()> {
        if self.state_map.is_some() {
            return Err(NsimError::configuration("States have already been set"));
        }
        let map = StateMap::new(names)?;
        self.node_states = DMatrix::zeros(self.network.node_count(), map.len());
        self.state_map = Some(map);
        Ok(())
    }

    /// Applies initial values in order; generators see earlier entries.
    pub fn set_initial_state(&mut self, initial: &InitialState) -> Result<()> {
        let state_map = self.state_map.as_ref().ok_or_else(states_not_set)?;
        let n = self.node_states.nrows();
        for (name, value) in initial.entries() {
            let col = state_map.index_of(name)?;
            match value {
                InitialValue::Scalar(v) => self.node_states.column_mut(col).fill(*v),
                InitialValue::Generator(generator) => {
                    let values = {
                        let view = ModelView::new(
                            &self.node_states,
                            &self.adjacency,
                            self.utility.as_ref(),
                            &self.network,
                            state_map,
                            &self.constants,
                            self.current_iteration,
                        );
                        let mut ctx = InitContext::new(view, &mut self.rng);
                        generator(&mut ctx)?
                    };
                    if values.len() != n {
                        return Err(NsimError::configuration(format!(
                            "Initial values for '{}' have length {}, expected {}",
                            name,
                            values.len(),
                            n
                        )));
                    }
                    self.node_states
                        .set_column(col, &DVector::from_vec(values));
                }
            }
        }
        Ok(())
    }

    /// Replaces the utility matrix.
    pub fn set_initial_utility(&mut self, utility: DMatrix<f64>) -> Result<()> {
        let n = self.network.node_count();
        let current = self
            .utility
            .as_mut()
            .ok_or_else(|| NsimError::configuration("Utility is not enabled for this model"))?;
        if utility.shape() != (n, n) {
            return Err(NsimError::configuration(format!(
                "Utility must be {}x{}, got {}x{}",
                n,
                n,
                utility.nrows(),
                utility.ncols()
            )));
        }
        *current = utility;
        Ok(())
    }

    /// Registers an update in the default scheme.
    pub fn add_update(&mut self, mut update: Update) -> Result<()> {
        self.prepare_update(&mut update)?;
        self.schemes[0].add_update(update);
        Ok(())
    }

    /// Registers a scheme after the existing ones.
    pub fn add_scheme(&mut self, mut scheme: Scheme) -> Result<()> {
        for update in scheme.updates_mut() {
            self.prepare_update(update)?;
        }
        self.schemes.push(scheme);
        Ok(())
    }

    /// Registers a property evaluated every `interval` ticks.
    pub fn add_property_function<F>(
        &mut self,
        name: impl Into<String>,
        interval: u64,
        function: F,
    ) -> Result<()>
    where
        F: Fn(&ModelView<'_>) -> Result<f64> + 'static,
    {
        let name = name.into();
        if interval == 0 {
            return Err(NsimError::configuration(format!(
                "Property '{}' needs an interval of at least 1",
                name
            )));
        }
        if self.properties.iter().any(|p| p.name == name) {
            return Err(NsimError::configuration(format!(
                "Property '{}' registered twice",
                name
            )));
        }
        self.property_results.insert(name.clone(), Vec::new());
        self.properties.push(Property {
            name,
            interval,
            function: Box::new(function),
        });
        Ok(())
    }

    pub fn set_constants(&mut self, constants: Constants) {
        self.constants = constants;
    }

    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    pub fn constants_mut(&mut self) -> &mut Constants {
        &mut self.constants
    }

    /// Binds conditions and checks the target against the configuration.
    fn prepare_update(&self, update: &mut Update) -> Result<()> {
        let state_map = self.state_map.as_ref().ok_or_else(states_not_set)?;
        let utility_enabled = self.utility.is_some();
        if update.target() == UpdateTarget::Utility && !utility_enabled {
            return Err(NsimError::configuration(format!(
                "Update '{}' targets utility but utility is not enabled",
                update.name()
            )));
        }
        if let Some(condition) = update.condition_mut() {
            condition.bind(state_map, utility_enabled)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Read-only view of the committed buffers.
    pub fn view(&self) -> Result<ModelView<'_>> {
        let state_map = self.state_map.as_ref().ok_or_else(states_not_set)?;
        Ok(ModelView::new(
            &self.node_states,
            &self.adjacency,
            self.utility.as_ref(),
            &self.network,
            state_map,
            &self.constants,
            self.current_iteration,
        ))
    }

    pub fn get_state(&self, name: &str) -> Result<DVector<f64>> {
        self.view()?.get_state(name)
    }

    pub fn get_state_index(&self, name: &str) -> Result<usize> {
        self.view()?.get_state_index(name)
    }

    pub fn get_node_state(&self, node: usize, name: &str) -> Result<f64> {
        self.view()?.get_node_state(node, name)
    }

    pub fn get_node_states(&self, node: usize) -> Result<Vec<f64>> {
        self.view()?.get_node_states(node)
    }

    pub fn get_nodes_state(&self, nodes: &[usize], name: &str) -> Result<Vec<f64>> {
        self.view()?.get_nodes_state(nodes, name)
    }

    pub fn get_nodes_states(&self) -> &DMatrix<f64> {
        &self.node_states
    }

    pub fn get_adjacency(&self) -> &DMatrix<f64> {
        &self.adjacency
    }

    pub fn get_neighbors(&self, node: usize) -> Vec<usize> {
        self.network.neighbors(node)
    }

    pub fn get_utility(&self) -> Result<&DMatrix<f64>> {
        self.utility
            .as_ref()
            .ok_or_else(|| NsimError::configuration("Utility is not enabled for this model"))
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn node_count(&self) -> usize {
        self.node_states.nrows()
    }

    /// State names in column order (empty before `set_states`).
    pub fn state_names(&self) -> &[String] {
        match &self.state_map {
            Some(map) => map.names(),
            None => &[],
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn schemes(&self) -> &[Scheme] {
        &self.schemes
    }

    /// Mutable scheme access, e.g. to move an activity window between runs.
    pub fn scheme_mut(&mut self, name: &str) -> Option<&mut Scheme> {
        self.schemes.iter_mut().find(|s| s.name() == name)
    }

    /// Index of the next tick to run.
    pub fn current_iteration(&self) -> u64 {
        self.current_iteration
    }

    /// Result history of every property, keyed by name.
    pub fn property_results(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.property_results
    }

    pub fn property_result(&self, name: &str) -> Option<&[f64]> {
        self.property_results.get(name).map(Vec::as_slice)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs a single tick and returns the committed state matrix.
    pub fn iteration(&mut self) -> Result<&DMatrix<f64>> {
        let tick = self.current_iteration;
        let state_map = self.state_map.as_ref().ok_or_else(states_not_set)?;

        // Compute
        let view = ModelView::new(
            &self.node_states,
            &self.adjacency,
            self.utility.as_ref(),
            &self.network,
            state_map,
            &self.constants,
            tick,
        );
        let mut shadow = ShadowBuffers::new(&self.node_states, self.utility.as_ref());
        let rng = &mut self.rng;

        for scheme in self.schemes.iter().filter(|s| s.is_active(tick)) {
            let sampled = scheme.sample(&mut SampleContext::new(view, rng))?;
            for update in scheme.updates() {
                let nodes = match update.condition() {
                    Some(condition) => condition.get_valid_nodes(
                        &sampled,
                        &self.node_states,
                        &self.adjacency,
                        self.utility.as_ref(),
                        rng,
                    )?,
                    None => sampled.clone(),
                };
                if nodes.is_empty() {
                    debug!("Tick {}: skipping update '{}' (no nodes)", tick, update.name());
                    continue;
                }

                let subset = update.get_nodes().then_some(nodes.as_slice());
                let mut ctx = UpdateContext::new(view, subset, update.args(), rng);
                match update.execute(&mut ctx)? {
                    UpdateOutput::State(changes) => {
                        shadow.apply_states(state_map, &nodes, &changes)?
                    }
                    UpdateOutput::Utility(values) => shadow.apply_utility(&nodes, &values)?,
                    UpdateOutput::Network(ops) => shadow.queue_network(ops),
                }
            }
        }

        // Assign
        let committed = shadow.commit(state_map, &self.network)?;
        self.node_states = committed.states;
        self.utility = committed.utility;
        if let Some(network) = committed.network {
            debug!(
                "Tick {}: topology now {} nodes, {} edges",
                tick,
                network.node_count(),
                network.edge_count()
            );
            self.adjacency = network.adjacency_matrix();
            self.network = network;
        }

        // PropertyEval
        self.evaluate_properties(tick)?;

        // Advance
        self.current_iteration += 1;
        Ok(&self.node_states)
    }

    fn evaluate_properties(&mut self, tick: u64) -> Result<()> {
        if self.properties.is_empty() {
            return Ok(());
        }
        let state_map = self.state_map.as_ref().ok_or_else(states_not_set)?;
        let view = ModelView::new(
            &self.node_states,
            &self.adjacency,
            self.utility.as_ref(),
            &self.network,
            state_map,
            &self.constants,
            tick,
        );
        for property in self.properties.iter().filter(|p| tick % p.interval == 0) {
            let value = (property.function)(&view)?;
            self.property_results
                .entry(property.name.clone())
                .or_default()
                .push(value);
        }
        Ok(())
    }

    /// Runs `n` ticks and returns the retained snapshots.
    ///
    /// A snapshot is retained when `tick % memory_interval == 0`. With a
    /// positive `state_memory` cap, exceeding it either clears the retained
    /// list (`HardReset`) or evicts the oldest snapshot (`SlidingWindow`).
    /// Disk streaming is independent of retention. If a tick fails, the
    /// snapshot file is finished with the blocks streamed so far.
    pub fn simulate(&mut self, n: u64) -> Result<Vec<Snapshot>> {
        let start = self.current_iteration;
        info!(
            "Simulating {} ticks from tick {} ({} nodes, {} schemes)",
            n,
            start,
            self.node_count(),
            self.schemes.len()
        );

        let mut writer = match (&self.config.path, self.config.save_disk) {
            (Some(path), true) => Some(SnapshotWriter::create(
                path,
                self.node_states.nrows(),
                self.node_states.ncols(),
            )?),
            _ => None,
        };

        let retained = match self.run_ticks(n, start, writer.as_mut()) {
            Ok(retained) => retained,
            Err(e) => {
                // Blocks streamed before the failing tick stay readable
                if let Some(writer) = writer {
                    let written = writer.written();
                    match writer.finish() {
                        Ok(path) => warn!(
                            "Run stopped at tick {}; {} snapshots kept in {}",
                            self.current_iteration,
                            written,
                            path.display()
                        ),
                        Err(close) => warn!("Could not finish snapshot file: {}", close),
                    }
                }
                return Err(e);
            }
        };

        if let Some(writer) = writer {
            let written = writer.written();
            let path = writer.finish()?;
            info!("Wrote {} snapshots to {}", written, path.display());
        }

        info!(
            "Simulation finished at tick {} ({} snapshots retained)",
            self.current_iteration,
            retained.len()
        );
        Ok(retained.into())
    }

    fn run_ticks(
        &mut self,
        n: u64,
        start: u64,
        mut writer: Option<&mut SnapshotWriter>,
    ) -> Result<VecDeque<Snapshot>> {
        let cap = self.config.state_memory;
        let mut retained: VecDeque<Snapshot> = VecDeque::new();
        for _ in 0..n {
            let tick = self.current_iteration;
            self.iteration()?;

            if tick % self.config.memory_interval == 0 {
                retained.push_back(Snapshot::new(tick, self.node_states.clone()));
                if cap > 0 && retained.len() > cap {
                    match self.config.retention {
                        RetentionPolicy::HardReset => retained.clear(),
                        RetentionPolicy::SlidingWindow => {
                            retained.pop_front();
                        }
                    }
                }
            }

            if let Some(writer) = writer.as_deref_mut() {
                if tick % self.config.save_interval == 0 {
                    writer.write(tick, &self.node_states)?;
                }
            }

            let progress = self.config.progress_interval;
            if progress > 0 && (tick - start + 1) % progress == 0 {
                debug!("Tick {}/{}", tick - start + 1, n);
            }
        }
        Ok(retained)
    }

    /// Zeroes states and utility and rewinds the tick counter.
    ///
    /// Configuration, schemes, properties and constants are kept; property
    /// histories are cleared. The random stream continues unless `reseed`
    /// is called.
    pub fn reset(&mut self) {
        let n = self.network.node_count();
        let s = self.state_map.as_ref().map_or(0, StateMap::len);
        self.node_states = DMatrix::zeros(n, s);
        if let Some(utility) = self.utility.as_mut() {
            *utility = DMatrix::zeros(n, n);
        }
        self.current_iteration = 0;
        for history in self.property_results.values_mut() {
            history.clear();
        }
    }

    /// Restarts the random stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = seeded_rng(seed);
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("nodes", &self.node_states.nrows())
            .field("states", &self.state_names())
            .field("schemes", &self.schemes)
            .field("current_iteration", &self.current_iteration)
            .finish()
    }
}

fn states_not_set() -> NsimError {
    NsimError::configuration("set_states must be called first")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{Condition, ConditionKind, ThresholdOperator};
    use crate::snapshot::read_snapshot_file;
    use crate::update::{NetworkOp, NodeAddition};
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn model(n: usize, config: ModelConfig) -> Model {
        let network = Network::ring_lattice(n, 2);
        let mut model = Model::new(network, config).unwrap();
        model.set_states(&["a", "b"]).unwrap();
        model
    }

    fn counter(name: &str) -> Update {
        Update::state(name, |ctx| {
            let a = ctx.view.get_state("a")?;
            Ok(UpdateOutput::state("a", a.add_scalar(1.0)))
        })
    }

    #[test]
    fn test_set_states_once() {
        let mut m = model(3, ModelConfig::default());
        assert_eq!(m.get_nodes_states().shape(), (3, 2));
        assert!(matches!(m.set_states(&["c"]), Err(NsimError::Configuration(_))));
    }

    #[test]
    fn test_setup_requires_states() {
        let mut m = Model::new(Network::empty(2), ModelConfig::default()).unwrap();
        assert!(matches!(m.add_update(counter("c")), Err(NsimError::Configuration(_))));
        assert!(m.iteration().is_err());
    }

    #[test]
    fn test_initial_state_in_order() {
        let mut m = model(4, ModelConfig::default());
        let initial = InitialState::new()
            .scalar("a", 2.0)
            .generator("b", |ctx| {
                let a = ctx.view.get_state("a")?;
                Ok(a.iter().map(|v| v * 3.0).collect())
            });
        m.set_initial_state(&initial).unwrap();

        assert_eq!(m.get_state("b").unwrap().as_slice(), &[6.0; 4]);

        let short = InitialState::new().generator("b", |_| Ok(vec![1.0]));
        assert!(matches!(
            m.set_initial_state(&short),
            Err(NsimError::Configuration(_))
        ));
    }

    #[test]
    fn test_shape_invariant() {
        let mut m = model(5, ModelConfig::default());
        m.add_update(counter("inc")).unwrap();
        for _ in 0..10 {
            assert_eq!(m.iteration().unwrap().shape(), (5, 2));
        }
        assert_eq!(m.current_iteration(), 10);
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[10.0; 5]);
    }

    #[test]
    fn test_last_write_wins_on_pre_tick_snapshot() {
        let mut m = model(3, ModelConfig::default());
        m.set_initial_state(&InitialState::new().scalar("a", 1.0)).unwrap();

        m.add_update(Update::state("first", |ctx| {
            let a = ctx.view.get_state("a")?;
            Ok(UpdateOutput::state("b", a.add_scalar(1.0)))
        }))
        .unwrap();
        m.add_update(Update::state("second", |ctx| {
            // Must see the pre-tick b (0), not the 2.0 written by "first"
            let b = ctx.view.get_state("b")?;
            Ok(UpdateOutput::state("b", b.add_scalar(10.0)))
        }))
        .unwrap();

        m.iteration().unwrap();
        assert_eq!(m.get_state("b").unwrap().as_slice(), &[10.0; 3]);
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[1.0; 3]);
    }

    #[test]
    fn test_scheme_window_in_engine() {
        let mut m = model(2, ModelConfig::default());
        let scheme = Scheme::all_nodes("window")
            .with_bounds(Some(2), Some(4))
            .with_update(counter("inc"));
        m.add_scheme(scheme).unwrap();

        m.simulate(6).unwrap();
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[2.0, 2.0]);
    }

    #[test]
    fn test_get_nodes_writes_subset_only() {
        let mut m = model(4, ModelConfig::default());
        let scheme = Scheme::new("evens", |_| Ok(vec![0, 2])).with_update(
            Update::state("mark", |ctx| {
                let nodes = ctx.nodes().unwrap_or_default();
                Ok(UpdateOutput::state("a", vec![5.0; nodes.len()]))
            })
            .with_nodes(),
        );
        m.add_scheme(scheme).unwrap();
        m.iteration().unwrap();

        assert_eq!(m.get_state("a").unwrap().as_slice(), &[5.0, 0.0, 5.0, 0.0]);
    }

    #[test]
    fn test_empty_subset_skips_update() {
        let mut m = model(3, ModelConfig::default());
        let never = Condition::state_threshold("a", ThresholdOperator::Gt, 100.0).unwrap();
        m.add_update(
            Update::state("boom", |_| Err(NsimError::execution("should not run")))
                .with_condition(never),
        )
        .unwrap();

        assert!(m.simulate(3).is_ok());
    }

    #[test]
    fn test_condition_narrows_nodes() {
        let mut m = model(3, ModelConfig::default());
        m.set_initial_state(&InitialState::new().generator("a", |_| Ok(vec![1.0, 5.0, 9.0])))
            .unwrap();
        let cond = Condition::state_threshold("a", ThresholdOperator::Ge, 5.0).unwrap();
        m.add_update(
            Update::state("flag", |_| Ok(UpdateOutput::state("b", 1.0))).with_condition(cond),
        )
        .unwrap();

        m.iteration().unwrap();
        assert_eq!(m.get_state("b").unwrap().as_slice(), &[0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_unknown_condition_state_rejected_at_registration() {
        let mut m = model(3, ModelConfig::default());
        let cond = Condition::state_threshold("missing", ThresholdOperator::Gt, 0.0).unwrap();
        let result = m.add_update(counter("c").with_condition(cond));
        assert!(matches!(result, Err(NsimError::Configuration(_))));
    }

    #[test]
    fn test_utility_requires_config() {
        let mut m = model(3, ModelConfig::default());
        let update = Update::utility("u", |_| Ok(UpdateOutput::Network(vec![])));
        assert!(matches!(m.add_update(update), Err(NsimError::Configuration(_))));

        let cond = Condition::stochastic(ConditionKind::Utility, 0.5).unwrap();
        assert!(matches!(
            m.add_update(counter("c").with_condition(cond)),
            Err(NsimError::Configuration(_))
        ));
        assert!(m.get_utility().is_err());
    }

    #[test]
    fn test_error_leaves_state_unchanged() {
        let mut m = model(3, ModelConfig::default());
        m.add_update(counter("inc")).unwrap();
        m.add_update(Update::state("fail", |ctx| {
            if ctx.view.iteration() == 1 {
                Err(NsimError::execution("boom"))
            } else {
                Ok(UpdateOutput::state("b", 0.0))
            }
        }))
        .unwrap();

        m.iteration().unwrap();
        assert!(matches!(m.iteration(), Err(NsimError::Execution(_))));
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[1.0; 3]);
        assert_eq!(m.current_iteration(), 1);
    }

    #[test]
    fn test_simulate_returns_every_tick() {
        let mut m = model(3, ModelConfig::default());
        m.add_update(counter("inc")).unwrap();
        let snapshots = m.simulate(5).unwrap();

        assert_eq!(snapshots.len(), 5);
        let ticks: Vec<u64> = snapshots.iter().map(|s| s.iteration).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4]);
        assert_eq!(snapshots[4].states[(0, 0)], 5.0);
    }

    #[test]
    fn test_memory_interval() {
        let mut m = model(2, ModelConfig::default().with_memory_interval(2));
        let snapshots = m.simulate(5).unwrap();
        let ticks: Vec<u64> = snapshots.iter().map(|s| s.iteration).collect();
        assert_eq!(ticks, vec![0, 2, 4]);
    }

    #[test]
    fn test_hard_reset_retention() {
        let config = ModelConfig::default().with_state_memory(3, RetentionPolicy::HardReset);
        let mut m = model(2, config);
        let snapshots = m.simulate(5).unwrap();

        // Tick 3 overflows the cap and clears everything
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].iteration, 4);
    }

    #[test]
    fn test_sliding_window_retention() {
        let config = ModelConfig::default().with_state_memory(3, RetentionPolicy::SlidingWindow);
        let mut m = model(2, config);
        let snapshots = m.simulate(5).unwrap();

        let ticks: Vec<u64> = snapshots.iter().map(|s| s.iteration).collect();
        assert_eq!(ticks, vec![2, 3, 4]);
    }

    #[test]
    fn test_disk_snapshots_round_trip() {
        let path = std::env::temp_dir().join(format!("nsim_model_{}.txt", std::process::id()));
        let config = ModelConfig::default().with_disk(&path, 2);
        let mut m = model(4, config);
        m.add_update(counter("inc")).unwrap();
        m.simulate(5).unwrap();

        let file = read_snapshot_file(&path).unwrap();
        assert_eq!(file.shape, (3, 4, 2));
        let ticks: Vec<u64> = file.snapshots.iter().map(|s| s.iteration).collect();
        assert_eq!(ticks, vec![0, 2, 4]);
        assert_eq!(file.snapshots[2].states[(3, 0)], 5.0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_disk_snapshots_follow_removal() {
        let path = std::env::temp_dir().join(format!("nsim_removal_{}.txt", std::process::id()));
        let mut m = model(4, ModelConfig::default().with_disk(&path, 1));
        let cull = Scheme::all_nodes("cull")
            .with_bounds(Some(1), Some(2))
            .with_update(Update::network("remove_first", |_| {
                Ok(UpdateOutput::Network(vec![NetworkOp::Remove(vec![0])]))
            }));
        m.add_scheme(cull).unwrap();
        m.simulate(3).unwrap();

        let file = read_snapshot_file(&path).unwrap();
        assert_eq!(file.shape, (3, 4, 2));
        let rows: Vec<usize> = file.snapshots.iter().map(|s| s.states.nrows()).collect();
        assert_eq!(rows, vec![4, 3, 3]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_failed_run_keeps_streamed_snapshots() {
        let path = std::env::temp_dir().join(format!("nsim_failed_{}.txt", std::process::id()));
        let mut m = model(3, ModelConfig::default().with_disk(&path, 1));
        m.add_update(counter("inc")).unwrap();
        m.add_update(Update::state("fail_late", |ctx| {
            if ctx.view.iteration() == 2 {
                return Err(NsimError::execution("tick 2 fails"));
            }
            Ok(UpdateOutput::state("b", 1.0))
        }))
        .unwrap();

        assert!(matches!(m.simulate(5), Err(NsimError::Execution(_))));
        assert_eq!(m.current_iteration(), 2);

        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        assert!(!std::path::PathBuf::from(partial).exists());

        let file = read_snapshot_file(&path).unwrap();
        assert_eq!(file.shape, (2, 3, 2));
        assert_eq!(file.snapshots[1].states[(0, 0)], 2.0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_remove_nodes() {
        let mut m = model(4, ModelConfig::default());
        m.add_update(Update::state("tag", |ctx| {
            let nodes = ctx.nodes_or_all();
            Ok(UpdateOutput::state(
                "a",
                nodes.iter().map(|&n| n as f64 * 10.0).collect::<Vec<_>>(),
            ))
        }))
        .unwrap();
        let cull = Scheme::all_nodes("cull")
            .with_upper_bound(1)
            .with_update(Update::network("remove_first", |_| {
                Ok(UpdateOutput::Network(vec![NetworkOp::Remove(vec![0])]))
            }));
        m.add_scheme(cull).unwrap();

        m.iteration().unwrap();
        assert_eq!(m.node_count(), 3);
        assert_eq!(m.get_adjacency().shape(), (3, 3));
        // Written in the pre-tick numbering, then renumbered
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[10.0, 20.0, 30.0]);

        m.iteration().unwrap();
        assert_eq!(m.node_count(), 3);
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[0.0, 10.0, 20.0]);
    }

    #[test]
    fn test_add_nodes() {
        let mut m = model(3, ModelConfig::default().with_utility(true));
        let mut init = BTreeMap::new();
        init.insert("b".to_string(), 4.0);
        let grow = Scheme::all_nodes("grow").with_upper_bound(1).with_update(
            Update::network("add", move |_| {
                Ok(UpdateOutput::Network(vec![NetworkOp::Add(
                    NodeAddition::new(1)
                        .with_states(vec![init.clone()])
                        .with_edges(vec![(0, 3)]),
                )]))
            }),
        );
        m.add_scheme(grow).unwrap();

        m.iteration().unwrap();
        assert_eq!(m.node_count(), 4);
        assert_eq!(m.get_node_state(3, "b").unwrap(), 4.0);
        assert!(m.get_neighbors(3).contains(&0));
        assert_eq!(m.get_utility().unwrap().shape(), (4, 4));
        assert_eq!(m.get_adjacency()[(0, 3)], 1.0);
    }

    #[test]
    fn test_edge_change() {
        let mut m = model(3, ModelConfig::default());
        let rewire = Scheme::all_nodes("rewire").with_upper_bound(1).with_update(
            Update::network("complete", |ctx| {
                let n = ctx.view.node_count();
                Ok(UpdateOutput::Network(vec![
                    NetworkOp::EdgeChange(DMatrix::zeros(n + 1, n + 1)),
                    NetworkOp::EdgeChange(Network::complete(n).adjacency_matrix()),
                ]))
            }),
        );
        m.add_scheme(rewire).unwrap();

        m.iteration().unwrap();
        assert_eq!(m.network().edge_count(), 3);
        assert_eq!(m.get_neighbors(0), vec![1, 2]);
    }

    #[test]
    fn test_utility_update() {
        let mut m = model(3, ModelConfig::default().with_utility(true));
        m.add_update(Update::utility("u", |_| {
            Ok(UpdateOutput::Utility(crate::update::UtilityValues::Entries(
                vec![(0, 2, 0.5)],
            )))
        }))
        .unwrap();
        m.iteration().unwrap();
        assert_eq!(m.get_utility().unwrap()[(0, 2)], 0.5);
    }

    #[test]
    fn test_properties() {
        let mut m = model(3, ModelConfig::default());
        m.add_update(counter("inc")).unwrap();
        m.add_property_function("mean_a", 2, |view| Ok(view.get_state("a")?.mean()))
            .unwrap();
        assert!(m.add_property_function("zero", 0, |_| Ok(0.0)).is_err());

        m.simulate(5).unwrap();
        let history = m.property_result("mean_a").unwrap();
        assert_eq!(history.len(), 3);
        assert_relative_eq!(history[0], 1.0);
        assert_relative_eq!(history[2], 5.0);
    }

    #[test]
    fn test_reset() {
        let mut m = model(3, ModelConfig::default());
        m.add_update(counter("inc")).unwrap();
        m.add_property_function("p", 1, |_| Ok(1.0)).unwrap();
        m.simulate(4).unwrap();

        m.reset();
        assert_eq!(m.current_iteration(), 0);
        assert_eq!(m.get_state("a").unwrap().as_slice(), &[0.0; 3]);
        assert!(m.property_result("p").unwrap().is_empty());
        assert_eq!(m.schemes()[0].updates().len(), 1);
    }

    #[test]
    fn test_seeded_runs_reproduce() {
        let run = |seed: u64| {
            let mut m = model(20, ModelConfig::default().with_seed(seed));
            let cond = Condition::stochastic(ConditionKind::State, 0.3).unwrap();
            let bump = Update::state("bump", |ctx| {
                let nodes = ctx.nodes().unwrap_or_default();
                let a = ctx.view.get_nodes_state(nodes, "a")?;
                Ok(UpdateOutput::state("a", a.iter().map(|v| v + 1.0).collect::<Vec<_>>()))
            })
            .with_nodes()
            .with_condition(cond);
            m.add_update(bump).unwrap();
            m.simulate(10).unwrap()
        };
        let first = run(9);
        assert_eq!(first, run(9));

        // Only some nodes were picked on each tick
        let last = &first[9].states;
        let total: f64 = last.column(0).sum();
        assert!(total > 0.0 && total < 200.0);
        assert!(last.column(0).iter().any(|&v| v != last[(0, 0)]));
        assert_ne!(first, run(10));
    }

    proptest! {
        #[test]
        fn prop_retention_cap_holds(cap in 1usize..8, n in 0u64..30, sliding in any::<bool>()) {
            let policy = if sliding {
                RetentionPolicy::SlidingWindow
            } else {
                RetentionPolicy::HardReset
            };
            let mut m = model(2, ModelConfig::default().with_state_memory(cap, policy));
            let snapshots = m.simulate(n).unwrap();

            prop_assert!(snapshots.len() <= cap);
            if sliding {
                prop_assert_eq!(snapshots.len(), (n as usize).min(cap));
            } else {
                prop_assert_eq!(snapshots.len(), n as usize % (cap + 1));
            }
        }
    }
}
