//! Model definitions behind the built-in scenarios.
//!
//! Each builder wires states, constants, schemes, updates and properties
//! into a fresh `Model` and applies the scenario's initial state. The
//! initial state is also exposed on its own so the sensitivity analysis can
//! re-apply it between runs.

use crate::exporter::VisualizationConfig;
use crate::scenarios::ScenarioId;
use nalgebra::{DMatrix, DVector};
use nsim_core::{
    derive_seed, seeded_rng, Condition, ConditionKind, Constants, InitialState, Model,
    ModelConfig, Network, NetworkOp, NodeAddition, NsimError, Result, Scheme, SimRng,
    StateChanges, ThresholdOperator, Update, UpdateOutput, UtilityValues,
};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};
use std::collections::BTreeMap;

/// Salt of the graph generator stream.
const GRAPH_SALT: u64 = 0x6772_6170_68;

/// Builds the model of `scenario` with `nodes` nodes.
pub fn build_model(scenario: ScenarioId, nodes: usize, config: ModelConfig) -> Result<Model> {
    match scenario {
        ScenarioId::Craving => craving_model(nodes, config),
        ScenarioId::Hiom => hiom_model(nodes, config),
        ScenarioId::Rewire => rewire_model(nodes, config),
    }
}

/// Initial state of `scenario`.
pub fn initial_state(scenario: ScenarioId) -> InitialState {
    match scenario {
        ScenarioId::Craving => craving_initial_state(),
        ScenarioId::Hiom => hiom_initial_state(),
        ScenarioId::Rewire => rewire_initial_state(),
    }
}

/// Constants varied by `--sensitivity`, with their bounds.
pub fn sensitivity_bounds(scenario: ScenarioId) -> BTreeMap<String, (f64, f64)> {
    let bounds: &[(&str, (f64, f64))] = match scenario {
        ScenarioId::Craving => &[("b", (0.3, 0.7)), ("d", (0.1, 0.3)), ("q", (0.6, 1.0))],
        ScenarioId::Hiom => &[("p", (0.5, 2.0)), ("s_O", (0.005, 0.02))],
        ScenarioId::Rewire => &[("mu", (0.05, 0.3)), ("decay", (0.01, 0.03))],
    };
    bounds
        .iter()
        .map(|(name, range)| (name.to_string(), *range))
        .collect()
}

/// Plot settings used for `--export`.
pub fn default_visualization(scenario: ScenarioId) -> VisualizationConfig {
    match scenario {
        ScenarioId::Craving => VisualizationConfig::new("A", "Self control vs craving simulation")
            .with_plot_interval(2)
            .with_limit("A", 0.0, 0.8)
            .with_limit("lambda", 0.5, 1.5)
            .with_limit("C", -1.0, 1.0)
            .with_limit("V", -1.0, 1.0)
            .with_limit("E", -1.0, 1.0)
            .with_limit("S", -1.0, 1.0),
        ScenarioId::Hiom => VisualizationConfig::new("O", "Hierarchical Ising opinion model")
            .with_plot_interval(100)
            .with_limit("A", 0.0, 1.0)
            .with_limit("O", -1.0, 1.0)
            .with_limit("I", -1.0, 1.0),
        ScenarioId::Rewire => VisualizationConfig::new("opinion", "Utility-driven rewiring")
            .with_plot_interval(5)
            .with_limit("opinion", 0.0, 1.0)
            .with_limit("energy", 0.0, 3.0),
    }
}

/// Mean of a state column (0 for an empty population).
pub fn mean(values: &DVector<f64>) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.mean()
    }
}

fn graph_rng(config: &ModelConfig) -> SimRng {
    seeded_rng(derive_seed(config.seed, GRAPH_SALT))
}

fn normal(mean: f64, std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std_dev)
        .map_err(|e| NsimError::execution(format!("Normal({}, {}): {}", mean, std_dev, e)))
}

fn poisson(lambda: f64, rng: &mut SimRng) -> Result<f64> {
    if lambda <= 0.0 {
        return Ok(0.0);
    }
    let dist = Poisson::new(lambda)
        .map_err(|e| NsimError::execution(format!("Poisson({}): {}", lambda, e)))?;
    Ok(dist.sample(rng))
}

// ----------------------------------------------------------------------
// Craving vs self-control
// ----------------------------------------------------------------------

pub fn craving_constants() -> Constants {
    Constants::new()
        .with("q", 0.8)
        .with("b", 0.5)
        .with("d", 0.2)
        .with("h", 0.2)
        .with("k", 0.25)
        .with("S+", 0.5)
        .with("p", 0.4)
}

pub fn craving_initial_state() -> InitialState {
    InitialState::new()
        .scalar("C", 0.0)
        .generator("S", |ctx| Ok(vec![ctx.constant("S+")?; ctx.node_count()]))
        .scalar("E", 1.0)
        .generator("V", |ctx| {
            let c = ctx.view.get_state("C")?;
            let s = ctx.view.get_state("S")?;
            let e = ctx.view.get_state("E")?;
            Ok((c - s - e).iter().map(|v| v.clamp(0.0, 1.0)).collect())
        })
        .scalar("lambda", 0.5)
        .generator("A", |ctx| {
            let q = ctx.constant("q")?;
            let v = ctx.view.get_state("V")?;
            let lambda = ctx.view.get_state("lambda")?;
            v.iter()
                .zip(lambda.iter())
                .map(|(v, l)| Ok(q * v + poisson(*l, ctx.rng())? / 7.0))
                .collect()
        })
}

fn craving_model(nodes: usize, config: ModelConfig) -> Result<Model> {
    let network = Network::random_geometric(nodes, 0.125, &mut graph_rng(&config));
    let mut model = Model::new(network, config)?;
    model.set_states(&["C", "S", "E", "V", "lambda", "A"])?;
    model.set_constants(craving_constants());

    model.add_update(Update::state("craving", |ctx| {
        let (b, d) = (ctx.constant("b")?, ctx.constant("d")?);
        let c = ctx.view.get_state("C")?;
        let a = ctx.view.get_state("A")?;
        let next = c.zip_map(&a, |c, a| c + b * a * (1.0 - c).min(1.0) - d * c);
        Ok(UpdateOutput::state("C", next))
    }))?;

    model.add_update(Update::state("self_control", |ctx| {
        let p = ctx.constant("p")?;
        let h = ctx.constant("h")?;
        let k = ctx.constant("k")?;
        let s_plus = ctx.constant("S+")?;
        let s = ctx.view.get_state("S")?;
        let c = ctx.view.get_state("C")?;
        let a = ctx.view.get_state("A")?;
        let next = DVector::from_fn(s.len(), |i, _| {
            s[i] + p * (s_plus - s[i]).max(0.0) - h * c[i] - k * a[i]
        });
        Ok(UpdateOutput::state("S", next))
    }))?;

    // Exhaustion grows with the addiction of neighbours
    model.add_update(Update::state("exhaustion", |ctx| {
        let e = ctx.view.get_state("E")?;
        let a = ctx.view.get_state("A")?;
        let pressure = ctx.view.get_adjacency() * a / 50.0;
        let next = e.zip_map(&pressure, |e, x| (e - x).max(-1.5));
        Ok(UpdateOutput::state("E", next))
    }))?;

    model.add_update(Update::state("vulnerability", |ctx| {
        let c = ctx.view.get_state("C")?;
        let s = ctx.view.get_state("S")?;
        let e = ctx.view.get_state("E")?;
        Ok(UpdateOutput::state("V", (c - s - e).map(|v| v.clamp(0.0, 1.0))))
    }))?;

    model.add_update(Update::state("cues", |ctx| {
        let lambda = ctx.view.get_state("lambda")?;
        Ok(UpdateOutput::state("lambda", lambda.add_scalar(0.01)))
    }))?;

    model.add_update(Update::state("addiction", |ctx| {
        let q = ctx.constant("q")?;
        let v = ctx.view.get_state("V")?;
        let lambda = ctx.view.get_state("lambda")?;
        let next = v
            .iter()
            .zip(lambda.iter())
            .map(|(v, l)| Ok(q * v + (poisson(*l, ctx.rng())? / 7.0).min(q * (1.0 - v))))
            .collect::<Result<Vec<f64>>>()?;
        Ok(UpdateOutput::state("A", next))
    }))?;

    // Highly addicted nodes get relief half of the time
    let relief = Condition::state_threshold("A", ThresholdOperator::Ge, 0.7)?
        .chain(Condition::stochastic(ConditionKind::State, 0.5)?);
    model.add_update(
        Update::state("relief", |ctx| {
            let nodes = ctx.nodes().unwrap_or_default();
            let a = ctx.view.get_nodes_state(nodes, "A")?;
            Ok(UpdateOutput::state(
                "A",
                a.into_iter().map(|v| v - 0.2).collect::<Vec<_>>(),
            ))
        })
        .with_condition(relief)
        .with_nodes(),
    )?;

    model.add_property_function("mean_A", 1, |view| Ok(mean(&view.get_state("A")?)))?;
    model.add_property_function("mean_C", 1, |view| Ok(mean(&view.get_state("C")?)))?;

    model.set_initial_state(&craving_initial_state())?;
    Ok(model)
}

// ----------------------------------------------------------------------
// Hierarchical Ising opinion model
// ----------------------------------------------------------------------

pub fn hiom_constants() -> Constants {
    Constants::new()
        .with("dt", 0.01)
        .with("A_min", -0.5)
        .with("A_star", 1.0)
        .with("s_O", 0.01)
        .with("s_I", 0.0)
        .with("d_A", 0.0)
        .with("p", 1.0)
        .with("r_min", 0.0)
        .with("t_O", f64::INFINITY)
}

pub fn hiom_initial_state() -> InitialState {
    InitialState::new()
        .generator("I", |ctx| {
            let dist = normal(0.0, 0.3)?;
            Ok((0..ctx.node_count()).map(|_| dist.sample(ctx.rng())).collect())
        })
        .generator("O", |ctx| {
            let dist = normal(0.0, 0.2)?;
            Ok((0..ctx.node_count()).map(|_| dist.sample(ctx.rng())).collect())
        })
        .scalar("A", 1.0)
}

/// Pairs the sampled node with a random neighbour: information moves toward
/// the more extreme opinion and both gain attention.
fn hiom_pairing() -> Update {
    Update::state("pairing", |ctx| {
        let view = ctx.view;
        let nodes = ctx.nodes().unwrap_or_default();
        let Some(&node) = nodes.first() else {
            return Ok(StateChanges::new().into());
        };
        let neighbors = view.get_neighbors(node);
        let Some(&nb) = neighbors.choose(ctx.rng()) else {
            return Ok(StateChanges::new().into());
        };

        let (o_node, o_nb) = (view.get_node_state(node, "O")?, view.get_node_state(nb, "O")?);
        let (i_node, i_nb) = (view.get_node_state(node, "I")?, view.get_node_state(nb, "I")?);
        if (o_node - o_nb).abs() > ctx.constant("t_O")? {
            return Ok(UpdateOutput::state("I", vec![i_node]));
        }

        let p = ctx.constant("p")?;
        let r_min = ctx.constant("r_min")?;
        let r = r_min + (1.0 - r_min) / (1.0 + (-p * (o_node - o_nb)).exp());
        let noise = normal(0.0, ctx.constant("s_I")?)?.sample(ctx.rng());
        let information = r * i_node + (1.0 - r) * i_nb + noise;

        let d_a = ctx.constant("d_A")?;
        let a_star = ctx.constant("A_star")?;
        let mut attention = BTreeMap::new();
        for who in [node, nb] {
            let a = view.get_node_state(who, "A")?;
            attention.insert(who, a + d_a * (2.0 * a_star - a));
        }

        Ok(StateChanges::new()
            .set("I", vec![information])
            .set("A", attention)
            .into())
    })
    .with_nodes()
}

fn hiom_model(nodes: usize, config: ModelConfig) -> Result<Model> {
    let network = Network::watts_strogatz(nodes, 2, 0.02, &mut graph_rng(&config));
    let mut model = Model::new(network, config)?;
    model.set_states(&["I", "A", "O"])?;
    model.set_constants(hiom_constants());

    model.add_scheme(
        Scheme::weighted_by_state("attention", "A", 1).with_update(hiom_pairing()),
    )?;
    model.add_scheme(
        Scheme::all_nodes("shrink_information")
            .with_lower_bound(5000)
            .with_update(Update::state("shrink_I", |ctx| {
                Ok(UpdateOutput::state("I", ctx.view.get_state("I")? * 0.999))
            })),
    )?;
    model.add_scheme(
        Scheme::all_nodes("shrink_attention")
            .with_lower_bound(10_000)
            .with_update(Update::state("shrink_A", |ctx| {
                Ok(UpdateOutput::state("A", ctx.view.get_state("A")? * 0.999))
            })),
    )?;

    model.add_update(Update::state("attention_decay", |ctx| {
        let d_a = ctx.constant("d_A")?;
        let n = ctx.view.node_count().max(1) as f64;
        let a = ctx.view.get_state("A")?;
        Ok(UpdateOutput::state("A", a.map(|a| a - 2.0 * d_a * a / n)))
    }))?;

    model.add_update(Update::state("opinion", |ctx| {
        let dt = ctx.constant("dt")?;
        let a_min = ctx.constant("A_min")?;
        let noise = normal(0.0, ctx.constant("s_O")?)?;
        let o = ctx.view.get_state("O")?;
        let a = ctx.view.get_state("A")?;
        let i = ctx.view.get_state("I")?;
        let next = (0..o.len())
            .map(|n| {
                let drift = o[n].powi(3) - (a[n] + a_min) * o[n] - i[n];
                o[n] - dt * drift + noise.sample(ctx.rng())
            })
            .collect::<Vec<_>>();
        Ok(UpdateOutput::state("O", next))
    }))?;

    model.add_property_function("mean_O", 10, |view| Ok(mean(&view.get_state("O")?)))?;
    model.add_property_function("polarization", 10, |view| {
        Ok(mean(&view.get_state("O")?.abs()))
    })?;

    model.set_initial_state(&hiom_initial_state())?;
    Ok(model)
}

// ----------------------------------------------------------------------
// Utility-driven rewiring
// ----------------------------------------------------------------------

pub fn rewire_constants() -> Constants {
    Constants::new()
        .with("mu", 0.1)
        .with("decay", 0.02)
        .with("arrival_interval", 10.0)
        .with("arrival_energy", 2.0)
}

pub fn rewire_initial_state() -> InitialState {
    InitialState::new()
        .generator("opinion", |ctx| {
            Ok((0..ctx.node_count()).map(|_| ctx.rng().gen::<f64>()).collect())
        })
        .generator("energy", |ctx| {
            Ok((0..ctx.node_count())
                .map(|_| ctx.rng().gen_range(0.5..3.0))
                .collect())
        })
}

/// Pairwise affinity `1 - |o_i - o_j|`, zero on the diagonal.
pub fn affinity(opinion: &DVector<f64>) -> DMatrix<f64> {
    let n = opinion.len();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            0.0
        } else {
            1.0 - (opinion[i] - opinion[j]).abs()
        }
    })
}

/// Each selected node drops its least useful link for the most useful
/// non-neighbour, when that is an improvement.
fn rewire_links() -> Result<Update> {
    let connected =
        Condition::threshold(ConditionKind::Adjacency, ThresholdOperator::Ge, 1.0, None)?
            .chain(Condition::stochastic(ConditionKind::Adjacency, 0.5)?);

    Ok(Update::network("rewire", |ctx| {
        let nodes = ctx.nodes().unwrap_or_default();
        let utility = ctx.view.get_utility()?;
        let mut adjacency = ctx.view.get_adjacency().clone();
        let n = adjacency.nrows();

        for &node in nodes {
            let by_utility =
                |a: &usize, b: &usize| utility[(node, *a)].total_cmp(&utility[(node, *b)]);
            let worst = (0..n)
                .filter(|&j| adjacency[(node, j)] != 0.0)
                .min_by(by_utility);
            let best = (0..n)
                .filter(|&j| j != node && adjacency[(node, j)] == 0.0)
                .max_by(by_utility);
            if let (Some(worst), Some(best)) = (worst, best) {
                if utility[(node, best)] > utility[(node, worst)] {
                    adjacency[(node, worst)] = 0.0;
                    adjacency[(worst, node)] = 0.0;
                    adjacency[(node, best)] = 1.0;
                    adjacency[(best, node)] = 1.0;
                }
            }
        }
        Ok(UpdateOutput::Network(vec![NetworkOp::EdgeChange(adjacency)]))
    })
    .with_condition(connected)
    .with_nodes())
}

/// Every `arrival_interval` ticks a fresh node joins, linked to a random node.
fn arrivals() -> Update {
    Update::network("arrive", |ctx| {
        let tick = ctx.view.iteration();
        let interval = ctx.constant("arrival_interval")?.max(1.0) as u64;
        if tick == 0 || tick % interval != 0 {
            return Ok(UpdateOutput::Network(Vec::new()));
        }

        let n = ctx.view.node_count();
        let mut states = BTreeMap::new();
        states.insert("opinion".to_string(), ctx.rng().gen::<f64>());
        states.insert("energy".to_string(), ctx.constant("arrival_energy")?);
        let edges = if n > 0 {
            vec![(ctx.rng().gen_range(0..n), n)]
        } else {
            Vec::new()
        };
        Ok(UpdateOutput::Network(vec![NetworkOp::Add(
            NodeAddition::new(1)
                .with_states(vec![states])
                .with_edges(edges),
        )]))
    })
}

fn rewire_model(nodes: usize, config: ModelConfig) -> Result<Model> {
    let network = Network::erdos_renyi(nodes, 0.1, &mut graph_rng(&config));
    let mut model = Model::new(network, config.with_utility(true))?;
    model.set_states(&["opinion", "energy"])?;
    model.set_constants(rewire_constants());

    model.add_update(Update::state("influence", |ctx| {
        let mu = ctx.constant("mu")?;
        let adjacency = ctx.view.get_adjacency();
        let opinion = ctx.view.get_state("opinion")?;
        let sums = adjacency * &opinion;
        let next = DVector::from_fn(opinion.len(), |i, _| {
            let degree = adjacency.row(i).sum();
            if degree > 0.0 {
                opinion[i] + mu * (sums[i] / degree - opinion[i])
            } else {
                opinion[i]
            }
        });
        Ok(UpdateOutput::state("opinion", next))
    }))?;

    model.add_update(Update::state("fatigue", |ctx| {
        let decay = ctx.constant("decay")?;
        Ok(UpdateOutput::state(
            "energy",
            ctx.view.get_state("energy")?.add_scalar(-decay),
        ))
    }))?;

    model.add_update(Update::utility("affinity", |ctx| {
        let opinion = ctx.view.get_state("opinion")?;
        Ok(UpdateOutput::Utility(UtilityValues::Rows(affinity(&opinion))))
    }))?;

    // Queued in this order: rewiring, then arrivals, then departures, so
    // every payload is valid in the numbering it was built against.
    model.add_scheme(Scheme::uniform("rewiring", 5).with_update(rewire_links()?))?;
    model.add_scheme(Scheme::all_nodes("arrivals").with_update(arrivals()))?;
    model.add_scheme(
        Scheme::all_nodes("departures").with_update(
            Update::network("depart", |ctx| {
                let nodes = ctx.nodes().unwrap_or_default();
                Ok(UpdateOutput::Network(vec![NetworkOp::Remove(nodes.to_vec())]))
            })
            .with_condition(Condition::state_threshold(
                "energy",
                ThresholdOperator::Le,
                0.0,
            )?)
            .with_nodes(),
        ),
    )?;

    model.add_property_function("population", 1, |view| Ok(view.node_count() as f64))?;
    model.add_property_function("edges", 1, |view| Ok(view.network().edge_count() as f64))?;
    model.add_property_function("mean_opinion", 1, |view| {
        Ok(mean(&view.get_state("opinion")?))
    })?;

    model.set_initial_state(&rewire_initial_state())?;
    let opinion = model.get_state("opinion")?;
    model.set_initial_utility(affinity(&opinion))?;
    Ok(model)
}
