//! Builds the concrete question list for one phase from the catalog, the
//! active scope, and the latest detection. Pure functions of their inputs, so
//! a replayed session reproduces the exact sequence it saw the first time.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;

use super::catalog::{AssessmentCatalog, PhaseKind, Question, ScopeFilter};
use super::config::{EngineConfig, GatePolicy, ShuffleMode};
use super::detector::Detection;

/// Placeholder tokens rewritten in dynamic prompts at build time.
const PRIMARY_TOKEN: &str = "[PRIMARY_ENTITY]";
const SECONDARY_TOKEN: &str = "[SECONDARY_ENTITY]";
/// Substituted when a token has no ranked entity to point at yet.
const FALLBACK_SUBJECT: &str = "your strongest pattern";

#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    #[error("phase index {0} is out of range")]
    UnknownPhase(usize),
    #[error("scoped phase '{0}' requires an answered gate")]
    GateRequired(String),
}

/// Everything a phase build needs, bundled so replay and live advancement
/// call the same code path.
pub struct SequenceContext<'a> {
    pub catalog: &'a AssessmentCatalog,
    pub config: &'a EngineConfig,
    pub scope: Option<&'a ScopeFilter>,
    pub detection: &'a Detection,
    pub refinement_passes: u8,
    pub shuffle_seed: u64,
}

impl SequenceContext<'_> {
    /// Materialize the ordered question list for `phase_index`.
    pub fn build_phase(&self, phase_index: usize) -> Result<Vec<Question>, SequenceError> {
        let phase = self
            .catalog
            .phase(phase_index)
            .ok_or(SequenceError::UnknownPhase(phase_index))?;

        let mut questions = match &phase.kind {
            PhaseKind::Gate { questions } => questions.clone(),
            PhaseKind::Fixed { questions, scoped } => {
                if *scoped && self.scope.is_none() {
                    if self.config.gate_policy == GatePolicy::RequireGate {
                        return Err(SequenceError::GateRequired(phase.id.clone()));
                    }
                    tracing::debug!(phase = %phase.id, "no gate answer; broadening to full catalog");
                }
                let scope = if *scoped { self.scope } else { None };
                let eligible = self.catalog.eligible_entities(scope);
                questions
                    .iter()
                    .filter(|question| question_in_scope(question, &eligible))
                    .cloned()
                    .collect()
            }
            PhaseKind::Adaptive { top_n, blocks } => {
                let mut out = Vec::new();
                for key in self.detection.top_keys(*top_n) {
                    match blocks.get(&key) {
                        Some(block) => out.extend(block.iter().cloned()),
                        None => tracing::warn!(
                            phase = %phase.id,
                            entity = %key,
                            "no adaptive block for ranked entity"
                        ),
                    }
                }
                out
            }
            PhaseKind::Refinement { blocks } => {
                if self.refinement_passes >= self.config.max_refinement_passes {
                    return Ok(Vec::new());
                }
                let mut out = Vec::new();
                for key in self.refinement_targets() {
                    if let Some(block) = blocks.get(&key) {
                        out.extend(block.iter().cloned());
                    }
                }
                out
            }
        };

        if self.config.shuffle == ShuffleMode::Shuffled {
            shuffle_stable_dynamics(&mut questions, self.shuffle_seed ^ phase_index as u64);
        }

        for question in &mut questions {
            if question.dynamic {
                question.prompt = self.resolve_tokens(&question.prompt);
            }
        }

        Ok(questions)
    }

    /// Entities the refinement phase should probe: ambiguous-score entities
    /// plus cross-pattern members, deduplicated, in ranked order.
    pub(crate) fn refinement_targets(&self) -> Vec<String> {
        let wanted: BTreeSet<&str> = self
            .detection
            .sub_inquiry
            .iter()
            .map(String::as_str)
            .chain(
                self.detection
                    .cross_patterns
                    .iter()
                    .flat_map(|pattern| pattern.members.iter().map(String::as_str)),
            )
            .collect();

        self.detection
            .ranked
            .iter()
            .filter(|entry| wanted.contains(entry.entity.as_str()))
            .map(|entry| entry.entity.clone())
            .collect()
    }

    fn resolve_tokens(&self, prompt: &str) -> String {
        let label_at = |rank: usize| {
            self.detection
                .ranked
                .get(rank)
                .map(|entry| self.catalog.entity_label(&entry.entity).to_string())
                .unwrap_or_else(|| FALLBACK_SUBJECT.to_string())
        };
        prompt
            .replace(PRIMARY_TOKEN, &label_at(0))
            .replace(SECONDARY_TOKEN, &label_at(1))
    }
}

/// A question stays in a scoped phase when it carries no directives at all, or
/// when at least one directive entity survives the scope filter.
fn question_in_scope(question: &Question, eligible: &BTreeSet<String>) -> bool {
    let mut directives = question
        .maps_to
        .iter()
        .chain(question.options.iter().filter_map(|o| o.maps_to.as_ref()))
        .peekable();
    if directives.peek().is_none() {
        return true;
    }
    directives.any(|directive| {
        directive
            .entities
            .iter()
            .any(|entity| eligible.contains(entity))
    })
}

/// Seeded shuffle that leaves dynamic questions at their authored positions;
/// their prompts reference earlier results and read oddly out of order.
fn shuffle_stable_dynamics(questions: &mut [Question], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let movable: Vec<usize> = questions
        .iter()
        .enumerate()
        .filter(|(_, q)| !q.dynamic)
        .map(|(i, _)| i)
        .collect();
    let mut pool: Vec<Question> = movable.iter().map(|&i| questions[i].clone()).collect();
    pool.shuffle(&mut rng);
    for (slot, question) in movable.into_iter().zip(pool) {
        questions[slot] = question;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::detector::{detect, DetectorThresholds};
    use crate::assessment::scoring::{ScoreBucket, ScoringWeights};
    use std::collections::BTreeMap;

    fn detection_for(totals: &[(&str, f32)]) -> Detection {
        let buckets: BTreeMap<String, ScoreBucket> = totals
            .iter()
            .map(|(key, total)| {
                (
                    key.to_string(),
                    ScoreBucket {
                        compulsion: *total,
                        ..ScoreBucket::default()
                    },
                )
            })
            .collect();
        let weights = ScoringWeights {
            compulsion: 1.0,
            aversion: 0.0,
            alignment: 0.0,
            trigger: 0.0,
            historical: 0.0,
        };
        let catalog = AssessmentCatalog::standard();
        detect(
            &buckets,
            &weights,
            &DetectorThresholds::default(),
            &catalog.groups,
        )
    }

    fn context<'a>(
        catalog: &'a AssessmentCatalog,
        config: &'a EngineConfig,
        scope: Option<&'a ScopeFilter>,
        detection: &'a Detection,
    ) -> SequenceContext<'a> {
        SequenceContext {
            catalog,
            config,
            scope,
            detection,
            refinement_passes: 0,
            shuffle_seed: 7,
        }
    }

    #[test]
    fn missing_gate_broadens_by_default() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let detection = Detection::default();
        let ctx = context(&catalog, &config, None, &detection);
        let questions = ctx.build_phase(1).unwrap();
        assert_eq!(questions.len(), 5);
    }

    #[test]
    fn missing_gate_errors_under_require_gate() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig {
            gate_policy: GatePolicy::RequireGate,
            ..EngineConfig::default()
        };
        let detection = Detection::default();
        let ctx = context(&catalog, &config, None, &detection);
        let err = ctx.build_phase(1).unwrap_err();
        assert!(matches!(err, SequenceError::GateRequired(_)));
    }

    #[test]
    fn scope_filters_scoped_phase_questions() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let scope = ScopeFilter::of(&["experiential"]);
        let detection = Detection::default();
        let ctx = context(&catalog, &config, Some(&scope), &detection);
        let questions = ctx.build_phase(1).unwrap();
        // scr_states has no stimulation-free option set excluded; every
        // question keeps at least one in-scope directive here.
        assert!(questions.iter().all(|q| q.id.starts_with("scr_")));
        assert!(questions.iter().any(|q| q.id == "scr_pull"));
    }

    #[test]
    fn adaptive_phase_follows_ranked_order() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let detection = detection_for(&[("ease", 8.0), ("approval", 5.0), ("security", 1.0)]);
        let ctx = context(&catalog, &config, None, &detection);
        let questions = ctx.build_phase(2).unwrap();
        let ids: Vec<&str> = questions.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "dd_ease_urge",
                "dd_ease_history",
                "dd_approval_urge",
                "dd_approval_history"
            ]
        );
    }

    #[test]
    fn refinement_targets_dedupe_and_keep_ranked_order() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        // approval and belonging clear the group bar and sit in the ambiguous
        // window, so they appear in both sources; once each in the output.
        let detection = detection_for(&[("approval", 5.0), ("belonging", 4.5), ("ease", 1.0)]);
        let ctx = context(&catalog, &config, None, &detection);
        let questions = ctx.build_phase(4).unwrap();
        let ids: Vec<&str> = questions.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["ref_approval", "ref_belonging"]);
    }

    #[test]
    fn refinement_is_empty_at_the_pass_ceiling() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let detection = detection_for(&[("approval", 5.0), ("belonging", 4.5)]);
        let mut ctx = context(&catalog, &config, None, &detection);
        ctx.refinement_passes = 1;
        assert!(ctx.build_phase(4).unwrap().is_empty());
    }

    #[test]
    fn dynamic_prompts_resolve_to_entity_labels() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let detection = detection_for(&[("security", 9.0), ("ease", 2.0)]);
        let ctx = context(&catalog, &config, None, &detection);
        let questions = ctx.build_phase(3).unwrap();
        let chain = questions.iter().find(|q| q.id == "int_chain").unwrap();
        assert!(chain.prompt.contains("Security"));
        assert!(!chain.prompt.contains(PRIMARY_TOKEN));
    }

    #[test]
    fn dynamic_prompts_fall_back_without_detection() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let detection = Detection::default();
        let ctx = context(&catalog, &config, None, &detection);
        let questions = ctx.build_phase(3).unwrap();
        let chain = questions.iter().find(|q| q.id == "int_chain").unwrap();
        assert!(chain.prompt.contains(FALLBACK_SUBJECT));
    }

    #[test]
    fn shuffle_is_deterministic_per_seed_and_phase() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig {
            shuffle: ShuffleMode::Shuffled,
            ..EngineConfig::default()
        };
        let detection = Detection::default();
        let ctx = context(&catalog, &config, None, &detection);
        let first = ctx.build_phase(1).unwrap();
        let second = ctx.build_phase(1).unwrap();
        assert_eq!(
            first.iter().map(|q| &q.id).collect::<Vec<_>>(),
            second.iter().map(|q| &q.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn shuffle_leaves_dynamic_questions_in_place() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig {
            shuffle: ShuffleMode::Shuffled,
            ..EngineConfig::default()
        };
        let detection = detection_for(&[("approval", 9.0)]);
        let ctx = context(&catalog, &config, None, &detection);
        let questions = ctx.build_phase(3).unwrap();
        assert_eq!(questions[0].id, "int_chain");
    }

    #[test]
    fn out_of_range_phase_is_an_error() {
        let catalog = AssessmentCatalog::standard();
        let config = EngineConfig::default();
        let detection = Detection::default();
        let ctx = context(&catalog, &config, None, &detection);
        assert!(matches!(
            ctx.build_phase(99),
            Err(SequenceError::UnknownPhase(99))
        ));
    }
}
