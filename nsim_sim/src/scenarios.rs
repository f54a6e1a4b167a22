//! Built-in simulation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Self-control vs craving dynamics on a random geometric graph
    Craving,

    /// Hierarchical Ising opinion model on a small-world graph
    Hiom,

    /// Utility-driven rewiring with node departures and arrivals
    Rewire,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![ScenarioId::Craving, ScenarioId::Hiom, ScenarioId::Rewire]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Craving => "craving",
            ScenarioId::Hiom => "hiom",
            ScenarioId::Rewire => "rewire",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Craving => {
                "Craving vs self-control, neighbour exhaustion, chained threshold/stochastic relief"
            }
            ScenarioId::Hiom => {
                "Opinion/information/attention dynamics, attention-weighted pairing, late schemes"
            }
            ScenarioId::Rewire => {
                "Utility tracking, edge rewiring, energy-based removal and periodic arrivals"
            }
        }
    }

    /// Number of nodes used when none is given.
    pub fn default_nodes(&self) -> usize {
        match self {
            ScenarioId::Craving => 200,
            ScenarioId::Hiom => 400,
            ScenarioId::Rewire => 60,
        }
    }

    /// Number of ticks used when none is given.
    pub fn default_ticks(&self) -> u64 {
        match self {
            ScenarioId::Craving => 100,
            ScenarioId::Hiom => 15_000,
            ScenarioId::Rewire => 100,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "craving" | "craving_vs_self_control" | "csc" => Ok(ScenarioId::Craving),
            "hiom" | "ising" => Ok(ScenarioId::Hiom),
            "rewire" | "rewiring" => Ok(ScenarioId::Rewire),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>().unwrap(), scenario);
            assert_eq!(scenario.to_string(), scenario.name());
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("HIOM".parse::<ScenarioId>().unwrap(), ScenarioId::Hiom);
        assert_eq!("csc".parse::<ScenarioId>().unwrap(), ScenarioId::Craving);
        assert!("time_warp".parse::<ScenarioId>().is_err());
    }
}
