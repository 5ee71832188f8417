//! Adaptive assessment core: catalog, scoring, detection, sequencing, and the
//! phase state machine that ties them together.
//!
//! The engine is entity-agnostic by contract: every score movement flows
//! through `ScoringDirective` metadata on questions and options, so a new
//! catalog never requires an engine change.

pub mod catalog;
pub mod config;
pub mod detector;
pub mod engine;
pub mod report;
pub mod scoring;
pub mod sequence;
pub mod store;

pub use catalog::{
    AnswerOption, AssessmentCatalog, CatalogError, CatalogLoader, EntityDescriptor, EntityGroup,
    PhaseKind, PhaseSpec, Question, QuestionKind, ScopeFilter, ScoringDirective, Signal,
};
pub use config::{EngineConfig, GatePolicy, ShuffleMode};
pub use detector::{Band, Confidence, CrossPattern, Detection, DetectorThresholds, RankedEntity};
pub use engine::{
    Advance, AnswerEvent, AssessmentEngine, EngineError, EngineStage, PhaseState, ProgressUpdate,
    QuestionRenderRequest,
};
pub use report::{AnalysisSnapshot, AnswerLogEntry, Priority, Recommendation, Severity};
pub use scoring::{score_all, Answer, AnswerValue, ScoreBucket, ScoringWeights};
pub use store::{HistoryEntry, InMemoryProgressStore, ProgressStore, StoreError, HISTORY_LIMIT};
