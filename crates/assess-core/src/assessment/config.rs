use serde::{Deserialize, Serialize};

use super::detector::DetectorThresholds;
use super::scoring::ScoringWeights;

/// What happens when a scoped phase is entered without a gate answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePolicy {
    /// Fall back to the unfiltered catalog, the behavior the source engines
    /// exhibited. The broadening is deliberate here, not a silent bug.
    #[default]
    BroadenToAll,
    /// Refuse to build the phase until the gate is answered.
    RequireGate,
}

/// Whether in-phase question order is shuffled to reduce response-order bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    #[default]
    Stable,
    Shuffled,
}

/// Rubric configuration for one engine instance. Catalog-level threshold
/// overrides take precedence over `thresholds` here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub thresholds: DetectorThresholds,
    #[serde(default)]
    pub gate_policy: GatePolicy,
    #[serde(default)]
    pub shuffle: ShuffleMode,
    #[serde(default = "default_max_refinement_passes")]
    pub max_refinement_passes: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            thresholds: DetectorThresholds::default(),
            gate_policy: GatePolicy::default(),
            shuffle: ShuffleMode::default(),
            max_refinement_passes: default_max_refinement_passes(),
        }
    }
}

fn default_max_refinement_passes() -> u8 {
    1
}
