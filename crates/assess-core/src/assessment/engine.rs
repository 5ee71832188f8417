//! The phase state machine. Owns one participant's run: presenting questions,
//! recording answers, advancing across phases, offering refinement, and
//! producing the final snapshot.
//!
//! Every accepted answer is written through to the progress store, and a
//! resumed run replays the catalog against the recorded answers to rebuild
//! the exact sequence that was presented. Scores are never persisted; they
//! are recomputed from answers on every detection run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::min;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::catalog::{AssessmentCatalog, PhaseKind, Question, QuestionKind, ScopeFilter};
use super::config::EngineConfig;
use super::detector::{detect, Detection, DetectorThresholds};
use super::report::{build_snapshot, AnalysisSnapshot};
use super::scoring::{score_all, Answer, AnswerValue};
use super::sequence::{SequenceContext, SequenceError};
use super::store::{append_history, load_history, HistoryEntry, ProgressStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no assessment is in progress")]
    NotActive,
    #[error("no refinement decision is pending")]
    NoPendingRefinement,
    #[error("'{0}' is not the current question")]
    NotCurrentQuestion(String),
    #[error("question '{0}' requires an answer")]
    AnswerRequired(String),
    #[error("invalid answer for '{question}': {detail}")]
    InvalidAnswer { question: String, detail: String },
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where the run currently stands. `RefinementOffered` parks the engine until
/// the participant consents to (or declines) the extra questions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStage {
    #[default]
    Idle,
    Active,
    RefinementOffered,
    Complete,
}

/// The persisted run state. Every field defaults so a snapshot written by an
/// older build (or partially corrupted) still restores what it can.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    #[serde(default)]
    pub phase_index: usize,
    #[serde(default)]
    pub question_index: usize,
    #[serde(default)]
    pub answers: BTreeMap<String, Answer>,
    #[serde(default)]
    pub scope: Option<ScopeFilter>,
    #[serde(default)]
    pub refinement_passes: u8,
    #[serde(default)]
    pub shuffle_seed: u64,
    #[serde(default)]
    pub stage: EngineStage,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub phase_index: usize,
    pub phase_count: usize,
    pub phase_id: String,
    pub phase_label: String,
    pub question_index: usize,
    pub phase_len: usize,
    pub answered: usize,
}

/// Everything a client needs to render the current question.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionRenderRequest {
    pub phase_id: String,
    pub phase_label: String,
    pub question: Question,
    pub progress: ProgressUpdate,
}

/// Emitted for each accepted answer; the service layer logs and counts these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerEvent {
    pub question_id: String,
    pub phase_id: String,
    pub kind: String,
    pub recorded_at: DateTime<Utc>,
}

/// Result of advancing the run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Advance {
    Question(QuestionRenderRequest),
    RefinementOffered { targets: Vec<String> },
    Complete(Box<AnalysisSnapshot>),
}

/// A completed (non-empty) phase and the questions it actually presented.
#[derive(Debug, Clone)]
struct PresentedPhase {
    index: usize,
    label: String,
    questions: Vec<Question>,
}

pub struct AssessmentEngine<S: ProgressStore> {
    catalog: Arc<AssessmentCatalog>,
    config: EngineConfig,
    store: S,
    namespace: String,
    state: PhaseState,
    sequence: Vec<Question>,
    presented: Vec<PresentedPhase>,
}

impl<S: ProgressStore> AssessmentEngine<S> {
    pub fn new(
        catalog: Arc<AssessmentCatalog>,
        config: EngineConfig,
        store: S,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            config,
            store,
            namespace: namespace.into(),
            state: PhaseState::default(),
            sequence: Vec::new(),
            presented: Vec::new(),
        }
    }

    pub fn catalog(&self) -> &AssessmentCatalog {
        &self.catalog
    }

    pub fn stage(&self) -> EngineStage {
        self.state.stage
    }

    pub fn current_question(&self) -> Option<&Question> {
        self.sequence.get(self.state.question_index)
    }

    /// Begin a fresh run, discarding any prior in-flight state.
    pub fn start(&mut self) -> Result<Advance, EngineError> {
        self.state = PhaseState {
            shuffle_seed: rand::random(),
            stage: EngineStage::Active,
            started_at: Some(Utc::now()),
            ..PhaseState::default()
        };
        self.presented.clear();
        self.sequence = self.build_phase(self.state.phase_index)?;
        tracing::info!(
            assessment = %self.catalog.slug,
            namespace = %self.namespace,
            "assessment started"
        );
        if self.sequence.is_empty() {
            return self.complete_phase();
        }
        self.persist()?;
        Ok(self.render_current())
    }

    /// Resume from persisted progress, or start fresh when there is none.
    /// An unreadable snapshot is logged and treated as absent.
    pub fn resume(&mut self) -> Result<Advance, EngineError> {
        let Some(raw) = self.store.load(&self.progress_key())? else {
            return self.start();
        };
        let state: PhaseState = match serde_json::from_value(raw) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(
                    assessment = %self.catalog.slug,
                    %error,
                    "unreadable progress snapshot; starting over"
                );
                return self.start();
            }
        };
        if !matches!(
            state.stage,
            EngineStage::Active | EngineStage::RefinementOffered
        ) {
            return self.start();
        }

        self.state = state;
        self.replay()?;

        match self.state.stage {
            EngineStage::RefinementOffered => {
                let detection = self.detect_over();
                let targets = self.context(&detection).refinement_targets();
                Ok(Advance::RefinementOffered { targets })
            }
            _ if self.sequence.is_empty() => self.complete_phase(),
            _ => Ok(self.render_current()),
        }
    }

    /// Record an answer for the current question. Re-answering overwrites.
    pub fn answer(
        &mut self,
        question_id: &str,
        value: AnswerValue,
    ) -> Result<AnswerEvent, EngineError> {
        if self.state.stage != EngineStage::Active {
            return Err(EngineError::NotActive);
        }
        let question = self
            .current_question()
            .filter(|question| question.id == question_id)
            .cloned()
            .ok_or_else(|| EngineError::NotCurrentQuestion(question_id.to_string()))?;

        validate_answer(&question, &value)?;

        let phase = self
            .catalog
            .phase(self.state.phase_index)
            .ok_or(SequenceError::UnknownPhase(self.state.phase_index))?;

        // Gate choices carry the scope that narrows later phases.
        if let (PhaseKind::Gate { .. }, AnswerValue::Choice { option }) = (&phase.kind, &value) {
            self.state.scope = question
                .options
                .get(*option)
                .and_then(|option| option.scope.clone());
        }

        let recorded_at = Utc::now();
        let event = AnswerEvent {
            question_id: question.id.clone(),
            phase_id: phase.id.clone(),
            kind: value.kind_label().to_string(),
            recorded_at,
        };
        self.state.answers.insert(
            question.id.clone(),
            Answer {
                question_id: question.id,
                value,
                recorded_at,
            },
        );
        self.persist()?;
        Ok(event)
    }

    /// Advance past the current question. Required questions must be answered
    /// first; skippable ones may pass through unanswered.
    pub fn next(&mut self) -> Result<Advance, EngineError> {
        if self.state.stage != EngineStage::Active {
            return Err(EngineError::NotActive);
        }
        if let Some(question) = self.current_question() {
            if !self.state.answers.contains_key(&question.id) && !question.skippable() {
                return Err(EngineError::AnswerRequired(question.id.clone()));
            }
            self.state.question_index += 1;
        }
        if self.state.question_index < self.sequence.len() {
            self.persist()?;
            return Ok(self.render_current());
        }
        self.complete_phase()
    }

    /// Step back one question, crossing into the previous phase when already
    /// at the first question. Recorded answers are kept; re-answering after
    /// stepping back overwrites and later phases are rebuilt accordingly.
    pub fn prev(&mut self) -> Result<Advance, EngineError> {
        if self.state.stage != EngineStage::Active {
            return Err(EngineError::NotActive);
        }
        if self.state.question_index > 0 {
            self.state.question_index -= 1;
        } else if let Some(prior) = self.presented.pop() {
            self.state.phase_index = prior.index;
            self.sequence = prior.questions;
            self.state.question_index = self.sequence.len().saturating_sub(1);
        }
        self.persist()?;
        Ok(self.render_current())
    }

    /// Answer the pending refinement offer. Declining finalizes with the
    /// detection as it stands.
    pub fn accept_refinement(&mut self, accept: bool) -> Result<Advance, EngineError> {
        if self.state.stage != EngineStage::RefinementOffered {
            return Err(EngineError::NoPendingRefinement);
        }
        self.state.stage = EngineStage::Active;
        if !accept {
            tracing::info!(assessment = %self.catalog.slug, "refinement declined");
            return self.finish();
        }
        self.sequence = self.build_phase(self.state.phase_index)?;
        if self.sequence.is_empty() {
            return self.finish();
        }
        self.state.question_index = 0;
        self.persist()?;
        Ok(self.render_current())
    }

    /// Abandon the run and clear persisted progress.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.store.clear(&self.progress_key())?;
        self.state = PhaseState::default();
        self.sequence.clear();
        self.presented.clear();
        Ok(())
    }

    pub fn progress(&self) -> ProgressUpdate {
        let (phase_id, phase_label) = self.phase_names(self.state.phase_index);
        ProgressUpdate {
            phase_index: self.state.phase_index,
            phase_count: self.catalog.phases.len(),
            phase_id,
            phase_label,
            question_index: self.state.question_index,
            phase_len: self.sequence.len(),
            answered: self.state.answers.len(),
        }
    }

    /// Detection over everything presented so far. Recomputed from scratch,
    /// so a revisited phase can never double-count.
    pub fn detection(&self) -> Detection {
        self.detect_over()
    }

    /// Completed runs archived for this participant, oldest first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, EngineError> {
        Ok(load_history(&self.store, &self.history_key())?)
    }

    fn complete_phase(&mut self) -> Result<Advance, EngineError> {
        let finished_index = self.state.phase_index;
        let sequence = std::mem::take(&mut self.sequence);
        if !sequence.is_empty() {
            let (_, label) = self.phase_names(finished_index);
            self.presented.push(PresentedPhase {
                index: finished_index,
                label,
                questions: sequence,
            });
        }
        if matches!(
            self.catalog.phase(finished_index).map(|p| &p.kind),
            Some(PhaseKind::Refinement { .. })
        ) {
            self.state.refinement_passes = self.state.refinement_passes.saturating_add(1);
        }

        let detection = self.detect_over();
        loop {
            self.state.phase_index += 1;
            let Some(phase) = self.catalog.phase(self.state.phase_index) else {
                return self.finish();
            };
            if let PhaseKind::Refinement { .. } = phase.kind {
                let upcoming = self.context(&detection).build_phase(self.state.phase_index)?;
                if upcoming.is_empty() {
                    continue;
                }
                self.state.stage = EngineStage::RefinementOffered;
                self.state.question_index = 0;
                let targets = self.context(&detection).refinement_targets();
                self.persist()?;
                tracing::debug!(
                    assessment = %self.catalog.slug,
                    ?targets,
                    "offering refinement questions"
                );
                return Ok(Advance::RefinementOffered { targets });
            }
            let sequence = self.context(&detection).build_phase(self.state.phase_index)?;
            if sequence.is_empty() {
                continue;
            }
            self.sequence = sequence;
            self.state.question_index = 0;
            self.persist()?;
            return Ok(self.render_current());
        }
    }

    fn finish(&mut self) -> Result<Advance, EngineError> {
        let detection = self.detect_over();
        let presented: Vec<(String, Vec<Question>)> = self
            .presented
            .iter()
            .map(|phase| (phase.label.clone(), phase.questions.clone()))
            .collect();
        let completed_at = Utc::now();
        let snapshot = build_snapshot(
            &self.catalog,
            &self.effective_thresholds(),
            &detection,
            &presented,
            &self.state.answers,
            completed_at,
        );
        append_history(
            &self.store,
            &self.history_key(),
            HistoryEntry {
                assessment: self.catalog.slug.clone(),
                completed_at,
                snapshot: serde_json::to_value(&snapshot).map_err(StoreError::from)?,
            },
        )?;
        self.store.clear(&self.progress_key())?;
        self.state.stage = EngineStage::Complete;
        tracing::info!(
            assessment = %self.catalog.slug,
            severity = snapshot.severity.label(),
            "assessment complete"
        );
        Ok(Advance::Complete(Box::new(snapshot)))
    }

    /// Rebuild the presented history and current sequence from recorded
    /// answers. Deterministic given the same catalog, config, and state.
    fn replay(&mut self) -> Result<(), EngineError> {
        self.presented.clear();
        self.sequence.clear();
        let upper = match self.state.stage {
            EngineStage::RefinementOffered => self.state.phase_index,
            _ => self.state.phase_index + 1,
        };
        for index in 0..upper {
            let detection = self.detect_over();
            let sequence = self.context(&detection).build_phase(index)?;
            let current = self.state.stage == EngineStage::Active && index == upper - 1;
            if current {
                self.sequence = sequence;
            } else if !sequence.is_empty() {
                let (_, label) = self.phase_names(index);
                self.presented.push(PresentedPhase {
                    index,
                    label,
                    questions: sequence,
                });
            }
        }
        if !self.sequence.is_empty() {
            self.state.question_index =
                min(self.state.question_index, self.sequence.len() - 1);
        }
        Ok(())
    }

    fn detect_over(&self) -> Detection {
        let eligible = self.catalog.eligible_entities(self.state.scope.as_ref());
        let questions = self
            .presented
            .iter()
            .flat_map(|phase| phase.questions.iter())
            .chain(self.sequence.iter());
        let buckets = score_all(questions, &self.state.answers, &eligible);
        detect(
            &buckets,
            &self.config.weights,
            &self.effective_thresholds(),
            &self.catalog.groups,
        )
    }

    fn effective_thresholds(&self) -> DetectorThresholds {
        self.catalog.thresholds.unwrap_or(self.config.thresholds)
    }

    fn context<'a>(&'a self, detection: &'a Detection) -> SequenceContext<'a> {
        SequenceContext {
            catalog: self.catalog.as_ref(),
            config: &self.config,
            scope: self.state.scope.as_ref(),
            detection,
            refinement_passes: self.state.refinement_passes,
            shuffle_seed: self.state.shuffle_seed,
        }
    }

    fn build_phase(&self, index: usize) -> Result<Vec<Question>, EngineError> {
        let detection = self.detect_over();
        Ok(self.context(&detection).build_phase(index)?)
    }

    fn render_current(&self) -> Advance {
        let question = self.sequence[self.state.question_index].clone();
        let (phase_id, phase_label) = self.phase_names(self.state.phase_index);
        Advance::Question(QuestionRenderRequest {
            phase_id,
            phase_label,
            question,
            progress: self.progress(),
        })
    }

    fn phase_names(&self, index: usize) -> (String, String) {
        self.catalog
            .phase(index)
            .map(|phase| (phase.id.clone(), phase.label.clone()))
            .unwrap_or_default()
    }

    fn persist(&self) -> Result<(), EngineError> {
        let payload = serde_json::to_value(&self.state).map_err(StoreError::from)?;
        self.store.save(&self.progress_key(), &payload)?;
        Ok(())
    }

    fn progress_key(&self) -> String {
        format!("{}:progress:{}", self.namespace, self.catalog.slug)
    }

    fn history_key(&self) -> String {
        format!("{}:history:{}", self.namespace, self.catalog.slug)
    }
}

fn validate_answer(question: &Question, value: &AnswerValue) -> Result<(), EngineError> {
    let invalid = |detail: String| EngineError::InvalidAnswer {
        question: question.id.clone(),
        detail,
    };
    match (question.kind, value) {
        (QuestionKind::SingleChoice, AnswerValue::Choice { option }) => {
            if *option >= question.options.len() {
                return Err(invalid(format!("option index {option} is out of range")));
            }
        }
        (QuestionKind::MultiSelect, AnswerValue::Selections { options }) => {
            if options.len() < question.min_selections as usize {
                return Err(invalid(format!(
                    "at least {} selections required",
                    question.min_selections
                )));
            }
            if options.len() > question.max_selections as usize {
                return Err(invalid(format!(
                    "at most {} selections allowed",
                    question.max_selections
                )));
            }
            let mut seen = std::collections::BTreeSet::new();
            for index in options {
                if *index >= question.options.len() {
                    return Err(invalid(format!("option index {index} is out of range")));
                }
                if !seen.insert(index) {
                    return Err(invalid(format!("option index {index} selected twice")));
                }
            }
        }
        (QuestionKind::Scaled, AnswerValue::Scale { value }) => {
            if !value.is_finite()
                || *value < question.scale.min
                || *value > question.scale.max
            {
                return Err(invalid(format!(
                    "value {value} outside scale {}..{}",
                    question.scale.min, question.scale.max
                )));
            }
        }
        (QuestionKind::Ranked, AnswerValue::Ranking { options }) => {
            if options.is_empty() {
                return Err(invalid("ranking cannot be empty".to_string()));
            }
            let mut seen = std::collections::BTreeSet::new();
            for index in options {
                if *index >= question.options.len() {
                    return Err(invalid(format!("option index {index} is out of range")));
                }
                if !seen.insert(index) {
                    return Err(invalid(format!("option index {index} ranked twice")));
                }
            }
        }
        (QuestionKind::FreeText, AnswerValue::Text { .. }) => {}
        (kind, value) => {
            return Err(invalid(format!(
                "{} answer does not fit a {} question",
                value.kind_label(),
                kind.label()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::store::InMemoryProgressStore;

    fn engine() -> AssessmentEngine<InMemoryProgressStore> {
        AssessmentEngine::new(
            Arc::new(AssessmentCatalog::standard()),
            EngineConfig::default(),
            InMemoryProgressStore::new(),
            "test",
        )
    }

    fn current_id(advance: &Advance) -> String {
        match advance {
            Advance::Question(request) => request.question.id.clone(),
            other => panic!("expected a question, got {other:?}"),
        }
    }

    #[test]
    fn start_presents_the_gate_question() {
        let mut engine = engine();
        let advance = engine.start().unwrap();
        assert_eq!(current_id(&advance), "gate_focus");
        assert_eq!(engine.stage(), EngineStage::Active);
    }

    #[test]
    fn answering_a_non_current_question_is_rejected() {
        let mut engine = engine();
        engine.start().unwrap();
        let err = engine
            .answer("scr_pull", AnswerValue::Choice { option: 0 })
            .unwrap_err();
        assert!(matches!(err, EngineError::NotCurrentQuestion(_)));
    }

    #[test]
    fn required_questions_block_next_until_answered() {
        let mut engine = engine();
        engine.start().unwrap();
        // The gate is optional, so skipping it moves into screening.
        let advance = engine.next().unwrap();
        assert_eq!(current_id(&advance), "scr_pull");
        let err = engine.next().unwrap_err();
        assert!(matches!(err, EngineError::AnswerRequired(_)));
    }

    #[test]
    fn gate_answer_captures_scope() {
        let mut engine = engine();
        engine.start().unwrap();
        engine
            .answer("gate_focus", AnswerValue::Choice { option: 1 })
            .unwrap();
        assert_eq!(engine.state.scope, Some(ScopeFilter::of(&["material"])));
        // The catch-all option clears it again.
        engine
            .answer("gate_focus", AnswerValue::Choice { option: 3 })
            .unwrap();
        assert_eq!(engine.state.scope, None);
    }

    #[test]
    fn scale_answers_are_bounds_checked() {
        let mut engine = engine();
        engine.start().unwrap();
        engine.next().unwrap();
        let err = engine
            .answer("scr_pull", AnswerValue::Scale { value: 3.0 })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidAnswer { .. }));
    }

    #[test]
    fn catalog_thresholds_override_the_config_tuning() {
        use crate::assessment::detector::Confidence;
        let mut catalog = AssessmentCatalog::standard();
        catalog.thresholds = Some(DetectorThresholds {
            moderate_threshold: 0.2,
            high_threshold: 0.5,
            ..DetectorThresholds::default()
        });
        let mut engine = AssessmentEngine::new(
            Arc::new(catalog),
            EngineConfig::default(),
            InMemoryProgressStore::new(),
            "test",
        );
        engine.start().unwrap();
        engine.next().unwrap();
        engine
            .answer("scr_pull", AnswerValue::Choice { option: 0 })
            .unwrap();
        let detection = engine.detection();
        // Under the default 6.0 high bar this single answer would read Low.
        assert_eq!(detection.primary().unwrap().confidence, Confidence::High);
    }

    #[test]
    fn reset_clears_persisted_progress() {
        let store = InMemoryProgressStore::new();
        let mut engine = AssessmentEngine::new(
            Arc::new(AssessmentCatalog::standard()),
            EngineConfig::default(),
            store.clone(),
            "test",
        );
        engine.start().unwrap();
        engine
            .answer("gate_focus", AnswerValue::Choice { option: 0 })
            .unwrap();
        engine.reset().unwrap();
        assert_eq!(engine.stage(), EngineStage::Idle);
        assert!(store
            .load("test:progress:dependency-patterns")
            .unwrap()
            .is_none());
    }
}
