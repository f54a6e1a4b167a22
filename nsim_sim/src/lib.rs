//! NSim Scenario Harness
//!
//! Builds the bundled network models on top of `nsim_core`, runs them
//! deterministically from a seed and turns the results into summaries,
//! visualizer exports and sensitivity reports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ models: craving / hiom / rewire (Model builders)     │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────────┐          ┌────▼────────────────┐           │
//! │  │ Model       │          │ SensitivityAnalysis │           │
//! │  │ simulate(n) │◄─────────│ reset / reseed /    │           │
//! │  └─────────────┘ re-runs  │ constants           │           │
//! │       │                   └─────────────────────┘           │
//! │  ┌────▼──────────────────────────────┐                      │
//! │  │ ScenarioResult ──► SimExport JSON │                      │
//! │  └───────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use nsim_sim::ScenarioRunner;
//! use nsim_sim::scenarios::ScenarioId;
//!
//! let runner = ScenarioRunner::new(42).with_ticks(50);
//! let result = runner.run(ScenarioId::Craving)?;
//! assert!(result.passed);
//! ```

pub mod error;
pub mod exporter;
pub mod models;
pub mod runner;
pub mod scenarios;
pub mod sensitivity;

pub use error::{Result, SimError};
pub use exporter::{Layout, SimExport, SimFrame, VisualizationConfig};
pub use runner::{ScenarioResult, ScenarioRunner};
pub use sensitivity::{
    SensitivityAnalysis, SensitivityConfig, SensitivityReport, SobolIndices, Statistic,
};
