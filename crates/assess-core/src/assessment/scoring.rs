use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::catalog::{Question, QuestionKind, ScoringDirective, Signal};

/// Submitted answer payload, keyed by question id in the answer log. Option
/// values reference option indices so the persisted form stays stable even if
/// option labels are reworded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerValue {
    Choice { option: usize },
    Selections { options: Vec<usize> },
    Scale { value: f32 },
    Ranking { options: Vec<usize> },
    Text { value: String },
}

impl AnswerValue {
    pub const fn kind_label(&self) -> &'static str {
        match self {
            Self::Choice { .. } => "choice",
            Self::Selections { .. } => "selections",
            Self::Scale { .. } => "scale",
            Self::Ranking { .. } => "ranking",
            Self::Text { .. } => "text",
        }
    }
}

/// One recorded answer; at most one per question id, overwritten on re-answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub question_id: String,
    pub value: AnswerValue,
    pub recorded_at: DateTime<Utc>,
}

/// Per-entity accumulator. Sub-indices are folded independently and combined
/// into a total by `ScoringWeights`; the struct itself carries no weighting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub compulsion: f32,
    pub aversion: f32,
    pub alignment: f32,
    pub trigger_match: f32,
    pub historical: f32,
}

impl ScoreBucket {
    pub(crate) fn add(&mut self, signal: Signal, amount: f32) {
        match signal {
            Signal::Compulsion => self.compulsion += amount,
            Signal::Aversion => self.aversion += amount,
            Signal::Alignment => self.alignment += amount,
            Signal::Trigger => self.trigger_match += amount,
            Signal::Historical => self.historical += amount,
        }
    }

    pub fn total(&self, weights: &ScoringWeights) -> f32 {
        self.compulsion * weights.compulsion
            + self.aversion * weights.aversion
            + self.alignment * weights.alignment
            + self.trigger_match * weights.trigger
            + self.historical * weights.historical
    }
}

/// Linear combination weights for the bucket sub-indices. Equal weights by
/// default, matching the observed engines; configurable, never literal-coded
/// per entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub compulsion: f32,
    pub aversion: f32,
    pub alignment: f32,
    pub trigger: f32,
    pub historical: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            compulsion: 0.20,
            aversion: 0.20,
            alignment: 0.20,
            trigger: 0.20,
            historical: 0.20,
        }
    }
}

/// Fold every answered question into fresh per-entity buckets.
///
/// Pure and total: malformed metadata and out-of-scope entities are skipped
/// silently, never an error. Buckets are always recomputed from scratch so a
/// revisited phase cannot double-count.
pub fn score_all<'a>(
    questions: impl IntoIterator<Item = &'a Question>,
    answers: &BTreeMap<String, Answer>,
    eligible: &BTreeSet<String>,
) -> BTreeMap<String, ScoreBucket> {
    let mut buckets: BTreeMap<String, ScoreBucket> = BTreeMap::new();

    for question in questions {
        let Some(answer) = answers.get(&question.id) else {
            continue;
        };
        score_one(&mut buckets, question, &answer.value, eligible);
    }

    buckets
}

/// Fold a single answer into the buckets. Exposed for incremental updates;
/// `score_all` remains the source of truth for detector runs.
pub(crate) fn score_one(
    buckets: &mut BTreeMap<String, ScoreBucket>,
    question: &Question,
    value: &AnswerValue,
    eligible: &BTreeSet<String>,
) {
    match (question.kind, value) {
        (QuestionKind::SingleChoice, AnswerValue::Choice { option }) => {
            if let Some(option) = question.options.get(*option) {
                if let Some(directive) = &option.maps_to {
                    apply(buckets, directive, question.weight, 1.0, eligible);
                }
            }
            if let Some(directive) = &question.maps_to {
                apply(buckets, directive, question.weight, 1.0, eligible);
            }
        }
        (QuestionKind::MultiSelect, AnswerValue::Selections { options }) => {
            // Each selection contributes independently; options carry their
            // own nested directives.
            for index in options {
                if let Some(option) = question.options.get(*index) {
                    if let Some(directive) = &option.maps_to {
                        apply(buckets, directive, question.weight, 1.0, eligible);
                    }
                }
            }
        }
        (QuestionKind::Scaled, AnswerValue::Scale { value }) => {
            if let Some(directive) = &question.maps_to {
                apply(buckets, directive, question.weight, *value, eligible);
            }
        }
        (QuestionKind::Ranked, AnswerValue::Ranking { options }) => {
            // Rank-1 contributes fully; later ranks decay linearly.
            let count = options.len().max(1) as f32;
            for (position, index) in options.iter().enumerate() {
                let factor = (count - position as f32) / count;
                if let Some(option) = question.options.get(*index) {
                    if let Some(directive) = &option.maps_to {
                        apply(buckets, directive, question.weight, factor, eligible);
                    }
                }
            }
        }
        (QuestionKind::FreeText, AnswerValue::Text { .. }) => {}
        // Kind/value mismatches should have been rejected at answer time;
        // scoring stays total by ignoring them.
        _ => {}
    }
}

fn apply(
    buckets: &mut BTreeMap<String, ScoreBucket>,
    directive: &ScoringDirective,
    question_weight: f32,
    factor: f32,
    eligible: &BTreeSet<String>,
) {
    for entity in &directive.entities {
        if !eligible.contains(entity) {
            continue;
        }
        buckets
            .entry(entity.clone())
            .or_default()
            .add(directive.signal, directive.weight * question_weight * factor);
    }
}
