//! Schemes: sampling policy + activity window + ordered updates.

use crate::context::SampleContext;
use crate::error::{NsimError, Result};
use crate::update::Update;
use rand::Rng;

/// User function choosing the candidate nodes of a scheme.
pub type SampleFn = Box<dyn Fn(&mut SampleContext<'_>) -> Result<Vec<usize>>>;

/// A group of updates sharing one node sample and one activity window.
pub struct Scheme {
    name: String,
    sampler: SampleFn,
    lower_bound: Option<u64>,
    upper_bound: Option<u64>,
    updates: Vec<Update>,
}

impl Scheme {
    /// Creates a scheme with a custom sampling function and no bounds.
    pub fn new<F>(name: impl Into<String>, sampler: F) -> Self
    where
        F: Fn(&mut SampleContext<'_>) -> Result<Vec<usize>> + 'static,
    {
        Self {
            name: name.into(),
            sampler: Box::new(sampler),
            lower_bound: None,
            upper_bound: None,
            updates: Vec::new(),
        }
    }

    /// Samples every node.
    pub fn all_nodes(name: impl Into<String>) -> Self {
        Self::new(name, |ctx| Ok(ctx.view.nodes()))
    }

    /// Samples `k` distinct nodes uniformly at random (all nodes if fewer).
    pub fn uniform(name: impl Into<String>, k: usize) -> Self {
        Self::new(name, move |ctx| {
            let n = ctx.view.node_count();
            let amount = k.min(n);
            Ok(rand::seq::index::sample(ctx.rng(), n, amount).into_vec())
        })
    }

    /// Samples `k` distinct nodes with probability proportional to `state`.
    pub fn weighted_by_state(name: impl Into<String>, state: impl Into<String>, k: usize) -> Self {
        let state = state.into();
        Self::new(name, move |ctx| {
            let weights: Vec<f64> = ctx.view.get_state(&state)?.iter().copied().collect();
            weighted_sample(&weights, k, ctx.rng())
        })
    }

    /// Sets the activity window `[lower, upper)`; `None` leaves a side open.
    pub fn with_bounds(mut self, lower: Option<u64>, upper: Option<u64>) -> Self {
        self.set_bounds(lower, upper);
        self
    }

    pub fn with_lower_bound(mut self, lower: u64) -> Self {
        self.lower_bound = Some(lower);
        self
    }

    pub fn with_upper_bound(mut self, upper: u64) -> Self {
        self.upper_bound = Some(upper);
        self
    }

    pub fn set_bounds(&mut self, lower: Option<u64>, upper: Option<u64>) {
        self.lower_bound = lower;
        self.upper_bound = upper;
    }

    /// Appends an update (builder style).
    pub fn with_update(mut self, update: Update) -> Self {
        self.updates.push(update);
        self
    }

    pub fn add_update(&mut self, update: Update) {
        self.updates.push(update);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lower_bound(&self) -> Option<u64> {
        self.lower_bound
    }

    pub fn upper_bound(&self) -> Option<u64> {
        self.upper_bound
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    pub(crate) fn updates_mut(&mut self) -> &mut [Update] {
        &mut self.updates
    }

    /// `lower <= tick < upper`, a missing bound being unbounded.
    pub fn is_active(&self, tick: u64) -> bool {
        self.lower_bound.map_or(true, |lower| tick >= lower)
            && self.upper_bound.map_or(true, |upper| tick < upper)
    }

    /// Runs the sampling function and checks the ids it returned.
    pub fn sample(&self, ctx: &mut SampleContext<'_>) -> Result<Vec<usize>> {
        let nodes = (self.sampler)(ctx)?;
        let n = ctx.view.node_count();
        if let Some(&bad) = nodes.iter().find(|&&node| node >= n) {
            return Err(NsimError::execution(format!(
                "Scheme '{}' sampled node {} but the model has {} nodes",
                self.name, bad, n
            )));
        }
        Ok(nodes)
    }
}

impl std::fmt::Debug for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheme")
            .field("name", &self.name)
            .field("lower_bound", &self.lower_bound)
            .field("upper_bound", &self.upper_bound)
            .field("updates", &self.updates)
            .finish()
    }
}

/// Draws `k` distinct indices, each draw proportional to the remaining weights.
fn weighted_sample<R: Rng + ?Sized>(weights: &[f64], k: usize, rng: &mut R) -> Result<Vec<usize>> {
    if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
        return Err(NsimError::execution("Sampling weights must be finite and non-negative"));
    }
    let mut remaining = weights.to_vec();
    let mut chosen = Vec::with_capacity(k.min(weights.len()));
    for _ in 0..k.min(weights.len()) {
        let total: f64 = remaining.iter().sum();
        if total <= 0.0 {
            if chosen.is_empty() {
                return Err(NsimError::execution("Sampling weights sum to zero"));
            }
            break;
        }
        let mut target = rng.gen::<f64>() * total;
        let mut pick = remaining.len() - 1;
        for (i, w) in remaining.iter().enumerate() {
            if *w > 0.0 && target < *w {
                pick = i;
                break;
            }
            target -= w;
        }
        // Float round-off can fall off the end; take the last positive weight
        if remaining[pick] <= 0.0 {
            pick = remaining.iter().rposition(|w| *w > 0.0).unwrap_or(pick);
        }
        chosen.push(pick);
        remaining[pick] = 0.0;
    }
    Ok(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::seeded_rng;
    use crate::network::Network;
    use crate::state::{Constants, StateMap};
    use crate::update::UpdateOutput;
    use crate::view::ModelView;
    use nalgebra::DMatrix;
    use proptest::prelude::*;

    fn sample_with(scheme: &Scheme, states: &DMatrix<f64>, seed: u64) -> Result<Vec<usize>> {
        let network = Network::empty(states.nrows());
        let adjacency = network.adjacency_matrix();
        let map = StateMap::new(&["w"]).unwrap();
        let constants = Constants::new();
        let view = ModelView::new(states, &adjacency, None, &network, &map, &constants, 0);
        let mut rng = seeded_rng(seed);
        scheme.sample(&mut SampleContext::new(view, &mut rng))
    }

    #[test]
    fn test_add_update_and_bounds() {
        let mut s = Scheme::all_nodes("s").with_bounds(Some(0), Some(10));
        s.add_update(Update::state("noop", |_| Ok(UpdateOutput::state("w", 0.0))));
        assert_eq!(s.updates().len(), 1);

        s.set_bounds(Some(10), Some(100));
        assert_eq!(s.lower_bound(), Some(10));
        assert_eq!(s.upper_bound(), Some(100));
    }

    #[test]
    fn test_window_boundaries() {
        let s = Scheme::all_nodes("s").with_bounds(Some(5), Some(8));
        assert!(!s.is_active(4));
        assert!(s.is_active(5));
        assert!(s.is_active(7));
        assert!(!s.is_active(8));

        let open = Scheme::all_nodes("open");
        assert!(open.is_active(0));
        assert!(open.is_active(u64::MAX));

        let late = Scheme::all_nodes("late").with_lower_bound(5000);
        assert!(!late.is_active(4999));
        assert!(late.is_active(5000));
    }

    #[test]
    fn test_custom_sampler() {
        let states = DMatrix::zeros(4, 1);
        let s = Scheme::new("all_but_last", |ctx| {
            let mut nodes = ctx.view.nodes();
            nodes.pop();
            Ok(nodes)
        });
        assert_eq!(sample_with(&s, &states, 0).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_range_sample_rejected() {
        let states = DMatrix::zeros(2, 1);
        let s = Scheme::new("bad", |_| Ok(vec![0, 7]));
        assert!(matches!(sample_with(&s, &states, 0), Err(NsimError::Execution(_))));
    }

    #[test]
    fn test_uniform_sample_distinct() {
        let states = DMatrix::zeros(20, 1);
        let s = Scheme::uniform("u", 5);
        let nodes = sample_with(&s, &states, 11).unwrap();
        assert_eq!(nodes.len(), 5);

        let mut sorted = nodes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 5);

        assert_eq!(nodes, sample_with(&s, &states, 11).unwrap());
    }

    #[test]
    fn test_weighted_sample_skips_zero_weight() {
        // Only node 2 carries weight
        let states = DMatrix::from_column_slice(4, 1, &[0.0, 0.0, 3.0, 0.0]);
        let s = Scheme::weighted_by_state("attention", "w", 1);
        for seed in 0..20 {
            assert_eq!(sample_with(&s, &states, seed).unwrap(), vec![2]);
        }

        let zeros = DMatrix::zeros(3, 1);
        assert!(sample_with(&s, &zeros, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_window_is_half_open(lower in 0u64..1000, len in 1u64..1000, tick in 0u64..3000) {
            let upper = lower + len;
            let s = Scheme::all_nodes("p").with_bounds(Some(lower), Some(upper));
            prop_assert_eq!(s.is_active(tick), lower <= tick && tick < upper);
            prop_assert!(s.is_active(lower));
            prop_assert!(s.is_active(upper - 1));
            prop_assert!(!s.is_active(upper));
        }
    }
}
