//! Initial state definitions.

use crate::context::InitContext;
use crate::error::Result;

/// Generator producing one value per node for a state.
pub type GeneratorFn = Box<dyn Fn(&mut InitContext<'_>) -> Result<Vec<f64>>>;

/// Initial value of one state.
pub enum InitialValue {
    /// Same value for every node
    Scalar(f64),
    /// Per-node values; sees the states initialised before it
    Generator(GeneratorFn),
}

impl std::fmt::Debug for InitialValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialValue::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
            InitialValue::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

/// Ordered mapping of state name to initial value.
///
/// Entries are applied in insertion order, so a generator can read any
/// state listed before it.
#[derive(Debug, Default)]
pub struct InitialState {
    entries: Vec<(String, InitialValue)>,
}

impl InitialState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scalar(mut self, state: impl Into<String>, value: f64) -> Self {
        self.entries.push((state.into(), InitialValue::Scalar(value)));
        self
    }

    pub fn generator<F>(mut self, state: impl Into<String>, generator: F) -> Self
    where
        F: Fn(&mut InitContext<'_>) -> Result<Vec<f64>> + 'static,
    {
        self.entries
            .push((state.into(), InitialValue::Generator(Box::new(generator))));
        self
    }

    pub fn entries(&self) -> &[(String, InitialValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
