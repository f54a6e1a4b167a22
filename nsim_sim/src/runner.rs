//! Scenario runner - builds and executes the built-in scenarios.

use crate::error::Result;
use crate::exporter::{SimExport, VisualizationConfig};
use crate::models::{build_model, default_visualization, mean};
use crate::scenarios::ScenarioId;

use nsim_core::{Model, ModelConfig, Snapshot};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether the final state passed the sanity checks
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Node count at the end of the run
    pub final_node_count: usize,

    /// Edge count at the end of the run
    pub final_edge_count: usize,

    /// Mean of every state over the final population
    pub final_means: BTreeMap<String, f64>,

    /// Last value of every property
    pub final_properties: BTreeMap<String, f64>,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Retained snapshots
    pub snapshots: Vec<Snapshot>,

    /// State names in column order
    pub state_names: Vec<String>,

    /// Edges of the final topology
    pub edges: Vec<(usize, usize)>,
}

impl ScenarioResult {
    /// Builds the visualizer export of this run with the scenario's plot
    /// settings.
    pub fn to_export(&self) -> Result<SimExport> {
        self.to_export_with(default_visualization(self.scenario))
    }

    pub fn to_export_with(&self, config: VisualizationConfig) -> Result<SimExport> {
        let mut export =
            SimExport::new(self.scenario.name(), self.seed, config, &self.state_names)?;
        export.add_snapshots(&self.snapshots);
        export.set_edges(self.edges.clone());
        Ok(export)
    }
}

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Ticks to run (scenario default if unset)
    ticks: Option<u64>,

    /// Node count (scenario default if unset)
    nodes: Option<usize>,

    /// Base model configuration; the seed is overridden
    config: ModelConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ticks: None,
            nodes: None,
            config: ModelConfig::default(),
        }
    }

    /// Sets the number of ticks.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = Some(ticks);
        self
    }

    /// Sets the number of nodes.
    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Sets the base model configuration.
    ///
    /// With `save_disk`, `path` names a directory that receives one
    /// snapshot file per scenario and seed.
    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    /// Streams snapshots of every run to `<dir>/<scenario>_<seed>.txt`.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>, interval: u64) -> Self {
        let dir = dir.into();
        self.config = self.config.with_disk(dir, interval);
        self
    }

    /// Model configuration for one scenario run.
    pub fn model_config(&self, scenario: ScenarioId) -> ModelConfig {
        let mut config = self.config.clone().with_seed(self.seed);
        if let (true, Some(dir)) = (config.save_disk, config.path.as_ref()) {
            config.path = Some(dir.join(format!("{}_{}.txt", scenario.name(), self.seed)));
        }
        // Keep long runs from retaining every tick
        if scenario == ScenarioId::Hiom && config.memory_interval == 1 && config.state_memory == 0 {
            config.memory_interval = 100;
        }
        config
    }

    /// Builds the model of `scenario` as this runner would.
    pub fn build(&self, scenario: ScenarioId) -> Result<Model> {
        let nodes = self.nodes.unwrap_or_else(|| scenario.default_nodes());
        Ok(build_model(scenario, nodes, self.model_config(scenario))?)
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult> {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);
        debug!("  {}", scenario.description());

        let ticks = self.ticks.unwrap_or_else(|| scenario.default_ticks());
        let mut model = self.build(scenario)?;
        let initial_states = model.state_names().len();
        let snapshots = model.simulate(ticks)?;

        let final_means = model
            .state_names()
            .iter()
            .map(|name| Ok((name.clone(), mean(&model.get_state(name)?))))
            .collect::<nsim_core::Result<BTreeMap<_, _>>>()?;
        let final_properties: BTreeMap<String, f64> = model
            .property_results()
            .iter()
            .filter_map(|(name, history)| history.last().map(|v| (name.clone(), *v)))
            .collect();

        let states = model.get_nodes_states();
        let failure_reason = if states.ncols() != initial_states {
            Some(format!(
                "State columns changed from {} to {}",
                initial_states,
                states.ncols()
            ))
        } else if states.iter().any(|v| !v.is_finite()) {
            Some("Non-finite state values".to_string())
        } else if model.get_adjacency().shape() != (states.nrows(), states.nrows()) {
            Some("Adjacency does not match the population".to_string())
        } else {
            None
        };
        if let Some(reason) = &failure_reason {
            warn!("{} (seed={}): {}", scenario.name(), self.seed, reason);
        }

        info!(
            "✓ {} complete: {} ticks, {} nodes, {} edges, {} snapshots",
            scenario.name(),
            ticks,
            model.node_count(),
            model.network().edge_count(),
            snapshots.len()
        );

        Ok(ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_ticks: ticks,
            final_node_count: model.node_count(),
            final_edge_count: model.network().edge_count(),
            final_means,
            final_properties,
            failure_reason,
            snapshots,
            state_names: model.state_names().to_vec(),
            edges: model.network().edges(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_craving_scenario() {
        let runner = ScenarioRunner::new(42).with_nodes(30).with_ticks(10);
        let result = runner.run(ScenarioId::Craving).unwrap();

        assert!(result.passed);
        assert_eq!(result.snapshots.len(), 10);
        assert_eq!(result.final_node_count, 30);
        assert!(result.final_means.contains_key("A"));
        assert!(result.final_properties.contains_key("mean_A"));
    }

    #[test]
    fn test_hiom_scenario_thins_snapshots() {
        let runner = ScenarioRunner::new(42).with_nodes(40).with_ticks(250);
        let result = runner.run(ScenarioId::Hiom).unwrap();

        assert!(result.passed);
        // Ticks 0, 100 and 200
        assert_eq!(result.snapshots.len(), 3);
    }

    #[test]
    fn test_rewire_scenario() {
        let runner = ScenarioRunner::new(7).with_nodes(25).with_ticks(30);
        let result = runner.run(ScenarioId::Rewire).unwrap();

        assert!(result.passed);
        assert_eq!(
            result.final_properties["population"],
            result.final_node_count as f64
        );
        assert_eq!(result.edges.len(), result.final_edge_count);
    }

    #[test]
    fn test_deterministic() {
        let runner1 = ScenarioRunner::new(42).with_nodes(20).with_ticks(15);
        let runner2 = ScenarioRunner::new(42).with_nodes(20).with_ticks(15);

        let result1 = runner1.run(ScenarioId::Rewire).unwrap();
        let result2 = runner2.run(ScenarioId::Rewire).unwrap();

        assert_eq!(result1.snapshots, result2.snapshots);
        assert_eq!(result1.edges, result2.edges);
    }

    #[test]
    fn test_snapshot_dir() {
        let dir = std::env::temp_dir().join(format!("nsim_runner_{}", std::process::id()));
        let runner = ScenarioRunner::new(3)
            .with_nodes(10)
            .with_ticks(4)
            .with_snapshot_dir(&dir, 2);
        runner.run(ScenarioId::Craving).unwrap();

        let file = nsim_core::read_snapshot_file(dir.join("craving_3.txt")).unwrap();
        assert_eq!(file.shape, (2, 10, 6));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_export_from_result() {
        let runner = ScenarioRunner::new(1).with_nodes(10).with_ticks(6);
        let result = runner.run(ScenarioId::Craving).unwrap();
        let export = result.to_export().unwrap();

        // plot_interval 2 over 6 snapshots
        assert_eq!(export.frames.len(), 3);
        assert_eq!(export.state_names.len(), 6);

        let custom = default_visualization(ScenarioId::Craving).with_plot_interval(3);
        assert_eq!(result.to_export_with(custom).unwrap().frames.len(), 2);
    }
}
