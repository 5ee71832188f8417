use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::catalog::EntityGroup;
use super::scoring::{ScoreBucket, ScoringWeights};

/// Confidence band derived from a ranked total score and the gap to the
/// runner-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Primary,
    CoDominant,
    Secondary,
    Peripheral,
}

impl Band {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Primary => "Primary",
            Self::CoDominant => "Co-Dominant",
            Self::Secondary => "Secondary",
            Self::Peripheral => "Peripheral",
        }
    }
}

/// Coarse high/medium/low confidence carried alongside the band, matching the
/// identified-loop labels the source engines exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub const fn label(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

/// Tunable cutoffs for banding and cross-pattern detection. One shared shape;
/// catalogs may override magnitudes per assessment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorThresholds {
    /// Top-2 gap below this makes both entities co-dominant.
    pub co_dominance_epsilon: f32,
    /// At or above: secondary band (when not primary/co-dominant).
    pub moderate_threshold: f32,
    /// High-confidence label floor.
    pub high_threshold: f32,
    /// Default per-member bar for cross-pattern groups.
    pub group_threshold: f32,
    /// Scores strictly inside (floor, ceiling) flag a sub-inquiry.
    pub sub_inquiry_floor: f32,
    pub high_confidence_ceiling: f32,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            co_dominance_epsilon: 1.0,
            moderate_threshold: 3.0,
            high_threshold: 6.0,
            group_threshold: 4.0,
            sub_inquiry_floor: 3.0,
            high_confidence_ceiling: 6.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
    pub entity: String,
    pub bucket: ScoreBucket,
    pub total_score: f32,
    pub band: Band,
    pub confidence: Confidence,
}

/// A detected relationship between two or more high-scoring entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossPattern {
    pub group: String,
    pub label: String,
    pub members: Vec<String>,
}

/// Output of one detector run over recomputed buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub ranked: Vec<RankedEntity>,
    pub cross_patterns: Vec<CrossPattern>,
    /// Entities whose score sits in the ambiguous window and would benefit
    /// from refinement questions.
    pub sub_inquiry: Vec<String>,
    pub multi_branching: bool,
}

impl Detection {
    pub fn primary(&self) -> Option<&RankedEntity> {
        self.ranked.first()
    }

    pub fn top_keys(&self, n: usize) -> Vec<String> {
        self.ranked
            .iter()
            .take(n)
            .map(|entry| entry.entity.clone())
            .collect()
    }
}

/// Rank entities, assign bands, and flag cross-patterns.
///
/// Deterministic: ties sort lexically by entity key. Empty buckets yield an
/// empty detection, never an error.
pub fn detect(
    buckets: &BTreeMap<String, ScoreBucket>,
    weights: &ScoringWeights,
    thresholds: &DetectorThresholds,
    groups: &[EntityGroup],
) -> Detection {
    if buckets.is_empty() {
        return Detection::default();
    }

    let mut scored: Vec<(String, ScoreBucket, f32)> = buckets
        .iter()
        .map(|(entity, bucket)| (entity.clone(), bucket.clone(), bucket.total(weights)))
        .collect();
    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });

    let top_score = scored[0].2;
    let runner_up = scored.get(1).map(|entry| entry.2);
    let co_dominant_top = runner_up
        .map(|second| (top_score - second).abs() < thresholds.co_dominance_epsilon)
        .unwrap_or(false);

    let ranked: Vec<RankedEntity> = scored
        .into_iter()
        .enumerate()
        .map(|(rank, (entity, bucket, total_score))| {
            // The runner-up stays secondary regardless of score; the
            // moderate bar applies from rank 3 down.
            let band = match rank {
                0 | 1 if co_dominant_top => Band::CoDominant,
                0 => Band::Primary,
                1 => Band::Secondary,
                _ if total_score >= thresholds.moderate_threshold => Band::Secondary,
                _ => Band::Peripheral,
            };
            let confidence = if total_score >= thresholds.high_threshold {
                Confidence::High
            } else if total_score >= thresholds.moderate_threshold {
                Confidence::Medium
            } else {
                Confidence::Low
            };
            RankedEntity {
                entity,
                bucket,
                total_score,
                band,
                confidence,
            }
        })
        .collect();

    let totals: BTreeMap<&str, f32> = ranked
        .iter()
        .map(|entry| (entry.entity.as_str(), entry.total_score))
        .collect();

    // General group-membership check: at least two members over the bar.
    let mut cross_patterns = Vec::new();
    for group in groups {
        let bar = group.threshold.unwrap_or(thresholds.group_threshold);
        let members: Vec<String> = group
            .members
            .iter()
            .filter(|member| totals.get(member.as_str()).is_some_and(|t| *t >= bar))
            .cloned()
            .collect();
        if members.len() >= 2 {
            cross_patterns.push(CrossPattern {
                group: group.key.clone(),
                label: group.label.clone(),
                members,
            });
        }
    }

    let sub_inquiry: Vec<String> = ranked
        .iter()
        .filter(|entry| {
            entry.total_score > thresholds.sub_inquiry_floor
                && entry.total_score < thresholds.high_confidence_ceiling
        })
        .map(|entry| entry.entity.clone())
        .collect();

    let multi_branching = !cross_patterns.is_empty() || !sub_inquiry.is_empty();

    Detection {
        ranked,
        cross_patterns,
        sub_inquiry,
        multi_branching,
    }
}
