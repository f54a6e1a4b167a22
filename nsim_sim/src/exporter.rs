//! JSON exporter for the animation front-end.
//!
//! Exports retained snapshots, plot settings and the final topology as JSON
//! for an external plotting script.

use crate::error::{Result, SimError};
use nsim_core::Snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Node placement used by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    #[default]
    Spring,
    /// Fruchterman-Reingold
    Fr,
}

impl std::str::FromStr for Layout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spring" => Ok(Layout::Spring),
            "fr" | "fruchterman_reingold" => Ok(Layout::Fr),
            _ => Err(format!("Unknown layout: {}", s)),
        }
    }
}

/// Plot settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationConfig {
    /// Plot every `plot_interval`-th retained snapshot
    pub plot_interval: usize,

    /// State used to colour the nodes
    pub plot_variable: String,

    /// Value range per state, as `(min, max)`
    pub variable_limits: BTreeMap<String, (f64, f64)>,

    /// Colour map name
    pub color_scale: String,

    /// Node placement
    #[serde(default)]
    pub layout: Layout,

    /// Figure title
    pub plot_title: String,

    /// Rendered file written by the front-end
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plot_output: Option<String>,
}

impl VisualizationConfig {
    pub fn new(plot_variable: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            plot_interval: 1,
            plot_variable: plot_variable.into(),
            variable_limits: BTreeMap::new(),
            color_scale: "RdBu".to_string(),
            layout: Layout::Spring,
            plot_title: title.into(),
            plot_output: None,
        }
    }

    pub fn with_plot_interval(mut self, interval: usize) -> Self {
        self.plot_interval = interval;
        self
    }

    pub fn with_limit(mut self, state: impl Into<String>, min: f64, max: f64) -> Self {
        self.variable_limits.insert(state.into(), (min, max));
        self
    }

    pub fn with_color_scale(mut self, scale: impl Into<String>) -> Self {
        self.color_scale = scale.into();
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.plot_output = Some(output.into());
        self
    }

    /// Checks the settings against the model's state names.
    pub fn validate(&self, state_names: &[String]) -> Result<()> {
        if self.plot_interval == 0 {
            return Err(SimError::export("plot_interval must be at least 1"));
        }
        let known = |name: &str| state_names.iter().any(|s| s == name);
        if !known(&self.plot_variable) {
            return Err(SimError::export(format!(
                "Plot variable '{}' is not a state",
                self.plot_variable
            )));
        }
        if self.color_scale.trim().is_empty() {
            return Err(SimError::export("color_scale must not be empty"));
        }
        if !self.variable_limits.contains_key(&self.plot_variable) {
            return Err(SimError::export(format!(
                "No limits for plot variable '{}'",
                self.plot_variable
            )));
        }
        for (state, (min, max)) in &self.variable_limits {
            if !known(state) {
                return Err(SimError::export(format!("Limits given for unknown state '{}'", state)));
            }
            if min >= max {
                return Err(SimError::export(format!(
                    "Limits for '{}' are empty: [{}, {}]",
                    state, min, max
                )));
            }
        }
        Ok(())
    }
}

/// A single plotted tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimFrame {
    /// Tick of the snapshot
    pub iteration: u64,

    /// One row of state values per node
    pub states: Vec<Vec<f64>>,
}

impl From<&Snapshot> for SimFrame {
    fn from(snapshot: &Snapshot) -> Self {
        Self {
            iteration: snapshot.iteration,
            states: snapshot
                .states
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Plot settings
    pub config: VisualizationConfig,

    /// State names in column order
    pub state_names: Vec<String>,

    /// Plotted frames
    pub frames: Vec<SimFrame>,

    /// Edges of the final topology
    pub edges: Vec<(usize, usize)>,
}

impl SimExport {
    /// Creates an empty export after validating `config`.
    pub fn new(
        scenario: &str,
        seed: u64,
        config: VisualizationConfig,
        state_names: &[String],
    ) -> Result<Self> {
        config.validate(state_names)?;
        Ok(Self {
            scenario: scenario.to_string(),
            seed,
            config,
            state_names: state_names.to_vec(),
            frames: Vec::new(),
            edges: Vec::new(),
        })
    }

    /// Adds every `plot_interval`-th snapshot as a frame.
    pub fn add_snapshots(&mut self, snapshots: &[Snapshot]) {
        let step = self.config.plot_interval.max(1);
        self.frames
            .extend(snapshots.iter().step_by(step).map(SimFrame::from));
    }

    pub fn set_edges(&mut self, edges: Vec<(usize, usize)>) {
        self.edges = edges;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    fn names() -> Vec<String> {
        vec!["A".to_string(), "B".to_string()]
    }

    #[test]
    fn test_validate() {
        let ok = VisualizationConfig::new("A", "t").with_limit("A", 0.0, 1.0);
        assert!(ok.validate(&names()).is_ok());

        let unknown = VisualizationConfig::new("Z", "t").with_limit("Z", 0.0, 1.0);
        assert!(matches!(unknown.validate(&names()), Err(SimError::Export(_))));

        let missing = VisualizationConfig::new("A", "t");
        assert!(missing.validate(&names()).is_err());

        let empty = ok.clone().with_limit("B", 1.0, 1.0);
        assert!(empty.validate(&names()).is_err());

        let zero = ok.clone().with_plot_interval(0);
        assert!(zero.validate(&names()).is_err());

        let no_colours = ok.with_color_scale(" ");
        assert!(no_colours.validate(&names()).is_err());
    }

    #[test]
    fn test_layout_and_output_serialized() {
        let config = VisualizationConfig::new("A", "t")
            .with_limit("A", 0.0, 1.0)
            .with_color_scale("viridis")
            .with_layout("fr".parse().unwrap())
            .with_output("out/run.gif");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["layout"], "fr");
        assert_eq!(json["color_scale"], "viridis");
        assert_eq!(json["plot_output"], "out/run.gif");

        let bare = serde_json::to_value(VisualizationConfig::new("A", "t")).unwrap();
        assert!(bare.get("plot_output").is_none());
        assert!("circle".parse::<Layout>().is_err());
    }

    #[test]
    fn test_frames_follow_plot_interval() {
        let config = VisualizationConfig::new("A", "t")
            .with_limit("A", 0.0, 1.0)
            .with_plot_interval(2);
        let mut export = SimExport::new("craving", 1, config, &names()).unwrap();
        let snapshots: Vec<Snapshot> = (0..5)
            .map(|t| Snapshot::new(t, DMatrix::from_element(3, 2, t as f64)))
            .collect();
        export.add_snapshots(&snapshots);

        let ticks: Vec<u64> = export.frames.iter().map(|f| f.iteration).collect();
        assert_eq!(ticks, vec![0, 2, 4]);
        assert_eq!(export.frames[1].states, vec![vec![2.0, 2.0]; 3]);
    }

    #[test]
    fn test_write_json() {
        let path = std::env::temp_dir().join(format!("nsim_export_{}.json", std::process::id()));
        let config = VisualizationConfig::new("B", "t").with_limit("B", -1.0, 1.0);
        let mut export = SimExport::new("rewire", 3, config, &names()).unwrap();
        export.set_edges(vec![(0, 1)]);
        export.write_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let back: SimExport = serde_json::from_str(&text).unwrap();
        assert_eq!(back, export);
        std::fs::remove_file(&path).unwrap();
    }
}
