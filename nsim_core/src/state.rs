//! State naming and model constants.

use crate::error::{NsimError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Bijection between state names and columns of the state matrix.
///
/// Created once by `Model::set_states` and never renamed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateMap {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl StateMap {
    /// Builds a map from an ordered list of names.
    ///
    /// Duplicate or empty names are rejected.
    pub fn new<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let mut map = Self::default();
        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                return Err(NsimError::configuration("State names must not be empty"));
            }
            if map.index.contains_key(name) {
                return Err(NsimError::configuration(format!(
                    "State '{}' declared twice",
                    name
                )));
            }
            map.index.insert(name.to_string(), map.names.len());
            map.names.push(name.to_string());
        }
        Ok(map)
    }

    /// Returns the column for `name`.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| NsimError::unknown_state(name))
    }

    /// Returns the state name of a column.
    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// State names in column order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

/// Named model parameters shared by every update, sampler and property.
///
/// The sensitivity analysis rewrites these between runs, so user functions
/// should read them through the context on every call instead of capturing
/// copies at setup time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constants(BTreeMap<String, f64>);

impl Constants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a constant.
    pub fn get(&self, name: &str) -> Result<f64> {
        self.0
            .get(name)
            .copied()
            .ok_or_else(|| NsimError::configuration(format!("Unknown constant '{}'", name)))
    }

    /// Returns the value of a constant, or `default` when it is not set.
    pub fn get_or(&self, name: &str, default: f64) -> f64 {
        self.0.get(name).copied().unwrap_or(default)
    }

    /// Sets (or overwrites) a constant.
    pub fn set(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Builder-style `set`.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Constants {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
