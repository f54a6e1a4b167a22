//! Variance-based sensitivity analysis over model constants.
//!
//! Parameter sets follow Saltelli's scheme: two independent base matrices
//! `A` and `B` of `samples` rows are drawn uniformly within the bounds, and
//! for every constant `i` the matrix `AB_i` takes column `i` from `B` and
//! the rest from `A` (with `second_order`, `BA_i` is the mirror image).
//! Each row runs the model from its initial state; the final state is
//! reduced to one number per state variable.
//!
//! Per state the report carries first-order (Saltelli 2010) and
//! total-order (Jansen) Sobol indices, optional second-order indices, and
//! the Pearson correlation of every constant with the outputs.

use crate::error::{Result, SimError};
use nsim_core::{derive_seed, InitialState, Model};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const SAMPLE_SALT: u64 = 0x5341;

/// Reduction applied to a state column of the final snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    #[default]
    Mean,
    /// Population variance
    Variance,
    Min,
    Max,
}

impl Statistic {
    pub fn name(&self) -> &'static str {
        match self {
            Statistic::Mean => "mean",
            Statistic::Variance => "variance",
            Statistic::Min => "min",
            Statistic::Max => "max",
        }
    }

    /// Reduces `values`; NaN for an empty slice.
    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            Statistic::Mean => mean(values),
            Statistic::Variance => variance(values),
            Statistic::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Statistic::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

impl std::fmt::Display for Statistic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mean" => Ok(Statistic::Mean),
            "variance" | "var" => Ok(Statistic::Variance),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            _ => Err(format!("Unknown statistic: {}", s)),
        }
    }
}

/// Configuration of a sensitivity analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityConfig {
    /// `(lower, upper)` per constant
    pub bounds: BTreeMap<String, (f64, f64)>,

    /// Rows of each base matrix
    pub samples: usize,

    /// Also estimate second-order indices
    pub second_order: bool,

    /// Reduction of the final snapshot
    pub statistic: Statistic,

    /// Ticks per run
    pub ticks: u64,

    /// Seed of the parameter stream and of every run
    pub seed: u64,
}

impl SensitivityConfig {
    pub fn new(bounds: BTreeMap<String, (f64, f64)>, samples: usize) -> Self {
        Self {
            bounds,
            samples,
            second_order: false,
            statistic: Statistic::Mean,
            ticks: 100,
            seed: 42,
        }
    }

    pub fn with_second_order(mut self, second_order: bool) -> Self {
        self.second_order = second_order;
        self
    }

    pub fn with_statistic(mut self, statistic: Statistic) -> Self {
        self.statistic = statistic;
        self
    }

    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Model runs per sample row: `D + 2`, or `2D + 2` with second order.
    pub fn runs_per_sample(&self) -> usize {
        let d = self.bounds.len();
        if self.second_order {
            2 * d + 2
        } else {
            d + 2
        }
    }

    /// Total number of model runs.
    pub fn run_count(&self) -> usize {
        self.samples * self.runs_per_sample()
    }

    pub fn validate(&self) -> Result<()> {
        if self.bounds.is_empty() {
            return Err(SimError::sensitivity("No bounds given"));
        }
        if self.samples == 0 {
            return Err(SimError::sensitivity("samples must be at least 1"));
        }
        for (name, (lower, upper)) in &self.bounds {
            if !lower.is_finite() || !upper.is_finite() || lower > upper {
                return Err(SimError::sensitivity(format!(
                    "Invalid bounds for '{}': [{}, {}]",
                    name, lower, upper
                )));
            }
        }
        Ok(())
    }
}

/// Sobol indices of one state variable, keyed by constant.
///
/// An index is `None` when the outputs have no variance or are not finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SobolIndices {
    pub first_order: BTreeMap<String, Option<f64>>,
    pub total_order: BTreeMap<String, Option<f64>>,

    /// Pairwise indices, present with `second_order`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub second_order: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

/// Outcome of a sensitivity analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    pub statistic: Statistic,

    /// Constants used by each run, in Saltelli order
    pub parameters: Vec<BTreeMap<String, f64>>,

    /// Reduced final value per state, one entry per run
    pub outputs: BTreeMap<String, Vec<f64>>,

    /// Sobol indices per state
    pub indices: BTreeMap<String, SobolIndices>,

    /// Pearson correlation per constant and state over every run
    pub correlations: BTreeMap<String, BTreeMap<String, Option<f64>>>,
}

/// Re-parameterizes and re-runs a model.
pub struct SensitivityAnalysis {
    config: SensitivityConfig,
}

impl SensitivityAnalysis {
    pub fn new(config: SensitivityConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SensitivityConfig {
        &self.config
    }

    /// Builds the Saltelli parameter sets.
    ///
    /// For each base row the runs are `A`, `AB_1..AB_D`, then `BA_1..BA_D`
    /// with second order, then `B`.
    pub fn sample_parameters(&self) -> Vec<BTreeMap<String, f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(self.config.seed, SAMPLE_SALT));
        let bounds: Vec<(f64, f64)> = self.config.bounds.values().copied().collect();
        let draw = |rng: &mut ChaCha8Rng| -> Vec<f64> {
            bounds
                .iter()
                .map(|&(lower, upper)| {
                    if lower < upper {
                        rng.gen_range(lower..upper)
                    } else {
                        lower
                    }
                })
                .collect()
        };

        let d = bounds.len();
        let mut rows = Vec::with_capacity(self.config.run_count());
        for _ in 0..self.config.samples {
            let a = draw(&mut rng);
            let b = draw(&mut rng);
            rows.push(a.clone());
            for i in 0..d {
                let mut ab = a.clone();
                ab[i] = b[i];
                rows.push(ab);
            }
            if self.config.second_order {
                for i in 0..d {
                    let mut ba = b.clone();
                    ba[i] = a[i];
                    rows.push(ba);
                }
            }
            rows.push(b);
        }

        rows.into_iter()
            .map(|row| self.config.bounds.keys().cloned().zip(row).collect())
            .collect()
    }

    /// Runs every parameter set on `model`.
    ///
    /// The model is reset between runs, so topology changes made by a run
    /// carry over to the next one; use `run_fresh` for such models.
    pub fn run(&self, model: &mut Model, initial: &InitialState) -> Result<SensitivityReport> {
        self.run_with(|| Ok(None), Some(model), initial)
    }

    /// Runs every parameter set on a freshly built model.
    pub fn run_fresh<F>(&self, mut build: F, initial: &InitialState) -> Result<SensitivityReport>
    where
        F: FnMut() -> Result<Model>,
    {
        self.run_with(|| build().map(Some), None, initial)
    }

    fn run_with<F>(
        &self,
        mut build: F,
        mut shared: Option<&mut Model>,
        initial: &InitialState,
    ) -> Result<SensitivityReport>
    where
        F: FnMut() -> Result<Option<Model>>,
    {
        let parameters = self.sample_parameters();
        let mut outputs: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        info!(
            "Sensitivity analysis: {} runs of {} ticks ({})",
            parameters.len(),
            self.config.ticks,
            self.config.statistic
        );

        for (i, params) in parameters.iter().enumerate() {
            debug!("Running simulation {}/{}", i + 1, parameters.len());
            let mut fresh = build()?;
            let model = match (fresh.as_mut(), shared.as_deref_mut()) {
                (Some(model), _) | (None, Some(model)) => model,
                (None, None) => {
                    return Err(SimError::sensitivity("No model to run"));
                }
            };
            if i == 0 {
                for name in params.keys().filter(|n| !model.constants().contains(n.as_str())) {
                    warn!("Constant '{}' is not used by the model", name);
                }
            }

            model.reset();
            model.reseed(self.config.seed);
            for (name, value) in params {
                model.constants_mut().set(name.clone(), *value);
            }
            model.set_initial_state(initial)?;
            model.simulate(self.config.ticks)?;

            let states = model.get_nodes_states();
            for (col, name) in model.state_names().iter().enumerate() {
                let column: Vec<f64> = states.column(col).iter().copied().collect();
                outputs
                    .entry(name.clone())
                    .or_default()
                    .push(self.config.statistic.reduce(&column));
            }
        }

        let names: Vec<String> = self.config.bounds.keys().cloned().collect();
        let indices = outputs
            .iter()
            .map(|(state, ys)| {
                let sobol = sobol_indices(ys, &names, self.config.second_order);
                (state.clone(), sobol)
            })
            .collect();

        let correlations = names
            .iter()
            .map(|constant| {
                let xs: Vec<f64> = parameters.iter().map(|p| p[constant]).collect();
                let per_state = outputs
                    .iter()
                    .map(|(state, ys)| (state.clone(), pearson(&xs, ys)))
                    .collect();
                (constant.clone(), per_state)
            })
            .collect();

        Ok(SensitivityReport {
            statistic: self.config.statistic,
            parameters,
            outputs,
            indices,
            correlations,
        })
    }
}

/// Sobol indices from outputs laid out as `sample_parameters` orders them.
pub fn sobol_indices(outputs: &[f64], names: &[String], second_order: bool) -> SobolIndices {
    let d = names.len();
    let step = if second_order { 2 * d + 2 } else { d + 2 };
    let rows: Vec<&[f64]> = outputs.chunks_exact(step).collect();
    let f_a: Vec<f64> = rows.iter().map(|r| r[0]).collect();
    let f_b: Vec<f64> = rows.iter().map(|r| r[step - 1]).collect();
    let f_ab = |i: usize| -> Vec<f64> { rows.iter().map(|r| r[1 + i]).collect() };
    let f_ba = |i: usize| -> Vec<f64> { rows.iter().map(|r| r[1 + d + i]).collect() };

    let usable = !rows.is_empty() && outputs.iter().all(|v| v.is_finite());
    let total_variance = variance(&[f_a.as_slice(), f_b.as_slice()].concat());
    let scale = (usable && total_variance > f64::EPSILON).then_some(total_variance);

    let first: Vec<Option<f64>> = (0..d)
        .map(|i| {
            let ab = f_ab(i);
            let terms = f_b.iter().zip(&ab).zip(&f_a).map(|((b, ab), a)| b * (ab - a));
            scale.map(|v| mean_of(terms) / v)
        })
        .collect();
    let total: Vec<Option<f64>> = (0..d)
        .map(|i| {
            let ab = f_ab(i);
            let terms = f_a.iter().zip(&ab).map(|(a, ab)| (a - ab).powi(2));
            scale.map(|v| 0.5 * mean_of(terms) / v)
        })
        .collect();

    let mut second = BTreeMap::new();
    if second_order {
        for j in 0..d {
            let ba = f_ba(j);
            let mut row = BTreeMap::new();
            for k in (j + 1)..d {
                let ab = f_ab(k);
                let value = scale.and_then(|v| {
                    let joint = mean_of(
                        ba.iter()
                            .zip(&ab)
                            .zip(f_a.iter().zip(&f_b))
                            .map(|((ba, ab), (a, b))| ba * ab - a * b),
                    ) / v;
                    Some(joint - first[j]? - first[k]?)
                });
                row.insert(names[k].clone(), value);
            }
            second.insert(names[j].clone(), row);
        }
    }

    SobolIndices {
        first_order: names.iter().cloned().zip(first).collect(),
        total_order: names.iter().cloned().zip(total).collect(),
        second_order: second,
    }
}

/// Pearson correlation over the pairs where both values are finite.
///
/// `None` with fewer than two pairs or when either side is constant.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys)
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .map(|(x, y)| (*x, *y))
        .collect();
    if pairs.len() < 2 {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut cov, mut var_x, mut var_y) = (0.0, 0.0, 0.0);
    for (x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x <= f64::EPSILON || var_y <= f64::EPSILON {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn mean_of(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    sum / count as f64
}

fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nsim_core::{ModelConfig, Network, Update, UpdateOutput};
    use proptest::prelude::*;

    fn growth_model() -> Model {
        let mut model = Model::new(Network::empty(4), ModelConfig::default()).unwrap();
        model.set_states(&["x"]).unwrap();
        model.constants_mut().set("rate", 1.0);
        model.constants_mut().set("unused", 0.0);
        model
            .add_update(Update::state("grow", |ctx| {
                let rate = ctx.constant("rate")?;
                Ok(UpdateOutput::state("x", ctx.view.get_state("x")?.add_scalar(rate)))
            }))
            .unwrap();
        model
    }

    fn bounds() -> BTreeMap<String, (f64, f64)> {
        let mut bounds = BTreeMap::new();
        bounds.insert("rate".to_string(), (0.0, 2.0));
        bounds.insert("unused".to_string(), (-1.0, 1.0));
        bounds
    }

    /// Evaluates `f` over the Saltelli rows of `analysis`.
    fn evaluate(analysis: &SensitivityAnalysis, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
        analysis
            .sample_parameters()
            .iter()
            .map(|p| f(&p.values().copied().collect::<Vec<_>>()))
            .collect()
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("x{}", i)).collect()
    }

    fn centred(d: usize) -> BTreeMap<String, (f64, f64)> {
        names(d).into_iter().map(|n| (n, (-1.0, 1.0))).collect()
    }

    #[test]
    fn test_statistics() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(Statistic::Mean.reduce(&values), 2.5);
        assert_relative_eq!(Statistic::Variance.reduce(&values), 1.25);
        assert_eq!(Statistic::Min.reduce(&values), 1.0);
        assert_eq!(Statistic::Max.reduce(&values), 4.0);
        assert!(Statistic::Mean.reduce(&[]).is_nan());

        assert_eq!("var".parse::<Statistic>().unwrap(), Statistic::Variance);
        assert!("median".parse::<Statistic>().is_err());
    }

    #[test]
    fn test_pearson() {
        let xs = [1.0, 2.0, 3.0];
        assert_relative_eq!(pearson(&xs, &[2.0, 4.0, 6.0]).unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(pearson(&xs, &[3.0, 2.0, 1.0]).unwrap(), -1.0, epsilon = 1e-12);
        assert_eq!(pearson(&xs, &[1.0, 1.0, 1.0]), None);
        assert_eq!(pearson(&[1.0], &[1.0]), None);
    }

    #[test]
    fn test_validation() {
        assert!(SensitivityAnalysis::new(SensitivityConfig::new(BTreeMap::new(), 3)).is_err());
        assert!(SensitivityAnalysis::new(SensitivityConfig::new(bounds(), 0)).is_err());

        let mut inverted = BTreeMap::new();
        inverted.insert("rate".to_string(), (2.0, 1.0));
        assert!(matches!(
            SensitivityAnalysis::new(SensitivityConfig::new(inverted, 3)),
            Err(SimError::Sensitivity(_))
        ));
    }

    #[test]
    fn test_saltelli_layout() {
        let config = SensitivityConfig::new(bounds(), 3);
        assert_eq!(config.run_count(), 12);
        assert_eq!(config.clone().with_second_order(true).run_count(), 18);

        let rows = SensitivityAnalysis::new(config).unwrap().sample_parameters();
        assert_eq!(rows.len(), 12);
        for block in rows.chunks(4) {
            let (a, ab_rate, ab_unused, b) = (&block[0], &block[1], &block[2], &block[3]);
            assert_eq!(ab_rate["rate"], b["rate"]);
            assert_eq!(ab_rate["unused"], a["unused"]);
            assert_eq!(ab_unused["rate"], a["rate"]);
            assert_eq!(ab_unused["unused"], b["unused"]);
            assert_ne!(a["rate"], b["rate"]);
        }
    }

    #[test]
    fn test_second_order_layout() {
        let config = SensitivityConfig::new(bounds(), 2).with_second_order(true);
        let rows = SensitivityAnalysis::new(config).unwrap().sample_parameters();
        for block in rows.chunks(6) {
            let (a, ba_rate, b) = (&block[0], &block[3], &block[5]);
            assert_eq!(ba_rate["rate"], a["rate"]);
            assert_eq!(ba_rate["unused"], b["unused"]);
        }
    }

    #[test]
    fn test_sobol_single_driver() {
        // f depends on x0 only
        let config = SensitivityConfig::new(centred(2), 2000).with_second_order(true);
        let analysis = SensitivityAnalysis::new(config).unwrap();
        let outputs = evaluate(&analysis, |x| x[0]);
        let sobol = sobol_indices(&outputs, &names(2), true);

        assert_relative_eq!(sobol.first_order["x0"].unwrap(), 1.0, epsilon = 0.15);
        assert_relative_eq!(sobol.total_order["x0"].unwrap(), 1.0, epsilon = 0.15);
        assert_eq!(sobol.first_order["x1"], Some(0.0));
        assert_eq!(sobol.total_order["x1"], Some(0.0));
        assert_relative_eq!(sobol.second_order["x0"]["x1"].unwrap(), 0.0, epsilon = 0.15);
    }

    #[test]
    fn test_sobol_additive_weights() {
        // Var(x0) : Var(2 x1) = 1 : 4
        let config = SensitivityConfig::new(centred(2), 2000);
        let analysis = SensitivityAnalysis::new(config).unwrap();
        let outputs = evaluate(&analysis, |x| x[0] + 2.0 * x[1]);
        let sobol = sobol_indices(&outputs, &names(2), false);

        assert_relative_eq!(sobol.total_order["x0"].unwrap(), 0.2, epsilon = 0.1);
        assert_relative_eq!(sobol.total_order["x1"].unwrap(), 0.8, epsilon = 0.15);
        assert!(sobol.first_order["x1"].unwrap() > sobol.first_order["x0"].unwrap());
        assert!(sobol.second_order.is_empty());
    }

    #[test]
    fn test_sobol_undefined_without_variance() {
        let outputs = vec![1.0; 8];
        let sobol = sobol_indices(&outputs, &names(2), false);
        assert_eq!(sobol.first_order["x0"], None);

        let mut with_nan = vec![0.5; 8];
        with_nan[3] = f64::NAN;
        assert_eq!(sobol_indices(&with_nan, &names(2), false).total_order["x1"], None);
    }

    #[test]
    fn test_run_reduces_final_state() {
        let analysis =
            SensitivityAnalysis::new(SensitivityConfig::new(bounds(), 64).with_ticks(5)).unwrap();
        let mut model = growth_model();
        let report = analysis
            .run(&mut model, &InitialState::new().scalar("x", 0.0))
            .unwrap();

        assert_eq!(report.parameters.len(), 256);
        let outputs = &report.outputs["x"];
        for (params, output) in report.parameters.iter().zip(outputs) {
            assert_relative_eq!(*output, 5.0 * params["rate"], epsilon = 1e-9);
        }

        let sobol = &report.indices["x"];
        assert!(sobol.total_order["rate"].unwrap() > 0.5);
        assert_relative_eq!(sobol.first_order["unused"].unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(sobol.total_order["unused"].unwrap(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(
            report.correlations["rate"]["x"].unwrap(),
            1.0,
            epsilon = 1e-9
        );
        // The model constant holds the last sample
        assert_eq!(model.constants().get("rate").unwrap(), report.parameters[255]["rate"]);
    }

    #[test]
    fn test_run_fresh_matches_shared() {
        let config = SensitivityConfig::new(bounds(), 4)
            .with_ticks(3)
            .with_statistic(Statistic::Max);
        let analysis = SensitivityAnalysis::new(config).unwrap();
        let initial = InitialState::new().scalar("x", 1.0);

        let shared = analysis.run(&mut growth_model(), &initial).unwrap();
        let fresh = analysis.run_fresh(|| Ok(growth_model()), &initial).unwrap();
        assert_eq!(shared, fresh);
    }

    proptest! {
        #[test]
        fn prop_samples_within_bounds(
            seed in any::<u64>(),
            lower in -10.0f64..10.0,
            width in 0.0f64..5.0,
        ) {
            let mut bounds = BTreeMap::new();
            bounds.insert("k".to_string(), (lower, lower + width));
            let analysis = SensitivityAnalysis::new(
                SensitivityConfig::new(bounds, 8).with_seed(seed),
            ).unwrap();

            let samples = analysis.sample_parameters();
            prop_assert_eq!(samples.len(), 24);
            for sample in &samples {
                prop_assert!(sample["k"] >= lower && sample["k"] <= lower + width);
            }
            prop_assert_eq!(samples, analysis.sample_parameters());
        }
    }
}
