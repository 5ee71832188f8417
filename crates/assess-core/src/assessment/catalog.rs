use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use super::detector::DetectorThresholds;

/// How a question is answered. `Scaled` carries a numeric slider value;
/// `Ranked` orders a subset of the options; `FreeText` is never scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    SingleChoice,
    MultiSelect,
    Scaled,
    Ranked,
    FreeText,
}

impl QuestionKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::SingleChoice => "Single Choice",
            Self::MultiSelect => "Multi Select",
            Self::Scaled => "Scaled",
            Self::Ranked => "Ranked",
            Self::FreeText => "Free Text",
        }
    }
}

/// Which sub-index of a `ScoreBucket` a directive moves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Compulsion,
    Aversion,
    #[default]
    Alignment,
    Trigger,
    Historical,
}

impl Signal {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Compulsion => "Compulsive Sourcing",
            Self::Aversion => "Avoidant Sourcing",
            Self::Alignment => "State Alignment",
            Self::Trigger => "Trigger Match",
            Self::Historical => "Historical Pattern",
        }
    }
}

/// Metadata-driven scoring payload. The engine never names entities itself;
/// every score movement is declared here, on a question or on an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringDirective {
    pub entities: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub signal: Signal,
}

impl ScoringDirective {
    pub fn new(entities: &[&str], weight: f32, signal: Signal) -> Self {
        Self {
            entities: entities.iter().map(|e| e.to_string()).collect(),
            weight,
            signal,
        }
    }
}

/// Narrows which entity families later phases consider. Established by a
/// gate-phase answer; absent means the full catalog is in play.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub families: BTreeSet<String>,
}

impl ScopeFilter {
    pub fn of(families: &[&str]) -> Self {
        Self {
            families: families.iter().map(|f| f.to_string()).collect(),
        }
    }

    pub fn allows(&self, family: &str) -> bool {
        self.families.contains(family)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maps_to: Option<ScoringDirective>,
    /// Gate options carry the scope they select.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeFilter>,
}

impl AnswerOption {
    pub fn plain(label: &str) -> Self {
        Self {
            label: label.to_string(),
            maps_to: None,
            scope: None,
        }
    }

    pub fn scoring(label: &str, maps_to: ScoringDirective) -> Self {
        Self {
            label: label.to_string(),
            maps_to: Some(maps_to),
            scope: None,
        }
    }

    pub fn scoped(label: &str, scope: ScopeFilter) -> Self {
        Self {
            label: label.to_string(),
            maps_to: None,
            scope: Some(scope),
        }
    }
}

/// Bounds for a scaled question's slider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleBounds {
    pub min: f32,
    pub max: f32,
}

impl Default for ScaleBounds {
    fn default() -> Self {
        Self { min: 1.0, max: 7.0 }
    }
}

/// Immutable question descriptor. Loaded once from the catalog; `dynamic`
/// prompts contain placeholder tokens resolved at sequence-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    pub kind: QuestionKind,
    #[serde(default)]
    pub options: Vec<AnswerOption>,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maps_to: Option<ScoringDirective>,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub min_selections: u8,
    #[serde(default = "default_max_selections")]
    pub max_selections: u8,
    #[serde(default)]
    pub scale: ScaleBounds,
}

impl Question {
    /// A question may be skipped by `next()` when it is not required, when it
    /// is a multi-select with no minimum, or when it is free text.
    pub fn skippable(&self) -> bool {
        !self.required
            || self.kind == QuestionKind::FreeText
            || (self.kind == QuestionKind::MultiSelect && self.min_selections == 0)
    }
}

fn default_weight() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_max_selections() -> u8 {
    3
}

/// The scored "thing" an assessment ranks; kept abstract in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescriptor {
    pub key: String,
    pub label: String,
    pub family: String,
}

impl EntityDescriptor {
    fn new(key: &str, label: &str, family: &str) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            family: family.to_string(),
        }
    }
}

/// A configured group of related entities; two or more members clearing the
/// group threshold emit a cross-pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityGroup {
    pub key: String,
    pub label: String,
    pub members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum PhaseKind {
    /// Coarse scoping question(s); answers establish the `ScopeFilter`.
    Gate { questions: Vec<Question> },
    /// Fixed catalog slice; `scoped` phases are filtered by the active scope.
    Fixed { questions: Vec<Question>, scoped: bool },
    /// Per-entity blocks appended for the top-N ranked entities.
    Adaptive {
        top_n: usize,
        blocks: BTreeMap<String, Vec<Question>>,
    },
    /// Conditional refinement blocks, consent-gated and ceiling-bounded.
    Refinement { blocks: BTreeMap<String, Vec<Question>> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: PhaseKind,
}

/// Read-only catalog value object threaded through the engine; replaces the
/// source engines' module-level mutable data globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentCatalog {
    pub slug: String,
    pub title: String,
    pub entities: Vec<EntityDescriptor>,
    pub phases: Vec<PhaseSpec>,
    #[serde(default)]
    pub groups: Vec<EntityGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<DetectorThresholds>,
}

impl AssessmentCatalog {
    pub fn entity(&self, key: &str) -> Option<&EntityDescriptor> {
        self.entities.iter().find(|entity| entity.key == key)
    }

    pub fn entity_label<'a>(&'a self, key: &'a str) -> &'a str {
        self.entity(key).map(|e| e.label.as_str()).unwrap_or(key)
    }

    /// Entity keys eligible under a scope filter; `None` means all.
    pub fn eligible_entities(&self, scope: Option<&ScopeFilter>) -> BTreeSet<String> {
        self.entities
            .iter()
            .filter(|entity| scope.map_or(true, |filter| filter.allows(&entity.family)))
            .map(|entity| entity.key.clone())
            .collect()
    }

    pub fn phase(&self, index: usize) -> Option<&PhaseSpec> {
        self.phases.get(index)
    }

    fn all_questions(&self) -> impl Iterator<Item = &Question> {
        self.phases.iter().flat_map(|phase| match &phase.kind {
            PhaseKind::Gate { questions } | PhaseKind::Fixed { questions, .. } => {
                questions.iter().collect::<Vec<_>>()
            }
            PhaseKind::Adaptive { blocks, .. } | PhaseKind::Refinement { blocks } => {
                blocks.values().flatten().collect()
            }
        })
    }

    /// Structural validation run before a catalog is handed to the engine.
    /// Directives naming unknown entities are tolerated (the accumulator
    /// skips them) but logged so bad data is visible in diagnostics.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.phases.is_empty() {
            return Err(CatalogError::Invalid {
                reference: self.slug.clone(),
                detail: "catalog has no phases".to_string(),
            });
        }

        let mut seen = BTreeSet::new();
        for question in self.all_questions() {
            if !seen.insert(question.id.clone()) {
                return Err(CatalogError::Invalid {
                    reference: self.slug.clone(),
                    detail: format!("duplicate question id '{}'", question.id),
                });
            }
        }

        let known: BTreeSet<&str> = self.entities.iter().map(|e| e.key.as_str()).collect();
        for phase in &self.phases {
            if let PhaseKind::Adaptive { blocks, .. } | PhaseKind::Refinement { blocks } =
                &phase.kind
            {
                for key in blocks.keys() {
                    if !known.contains(key.as_str()) {
                        return Err(CatalogError::Invalid {
                            reference: self.slug.clone(),
                            detail: format!(
                                "phase '{}' block references unknown entity '{}'",
                                phase.id, key
                            ),
                        });
                    }
                }
            }
        }

        for question in self.all_questions() {
            let directives = question
                .maps_to
                .iter()
                .chain(question.options.iter().filter_map(|o| o.maps_to.as_ref()));
            for directive in directives {
                for entity in &directive.entities {
                    if !known.contains(entity.as_str()) {
                        tracing::warn!(
                            question = %question.id,
                            entity = %entity,
                            "scoring directive references an entity outside the catalog; it will be skipped"
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Built-in demonstration catalog: a compact dependency-pattern screener
    /// exercising every phase kind the engine supports.
    pub fn standard() -> Self {
        standard_catalog()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to load catalog '{reference}': {source}")]
    Load {
        reference: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse catalog '{reference}': {source}")]
    Parse {
        reference: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid catalog '{reference}': {detail}")]
    Invalid { reference: String, detail: String },
}

/// Loads catalogs and caches them by reference so repeat loads are free.
/// A catalog that fails to load or validate is never partially applied.
#[derive(Default)]
pub struct CatalogLoader {
    cache: Mutex<HashMap<String, Arc<AssessmentCatalog>>>,
}

/// Reference resolved to the built-in catalog instead of a file path.
pub const STANDARD_CATALOG: &str = "standard";

impl CatalogLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, reference: &str) -> Result<Arc<AssessmentCatalog>, CatalogError> {
        if let Some(hit) = self
            .cache
            .lock()
            .expect("catalog cache mutex poisoned")
            .get(reference)
        {
            return Ok(Arc::clone(hit));
        }

        let catalog = if reference == STANDARD_CATALOG {
            AssessmentCatalog::standard()
        } else {
            let raw =
                std::fs::read_to_string(reference).map_err(|source| CatalogError::Load {
                    reference: reference.to_string(),
                    source,
                })?;
            serde_json::from_str(&raw).map_err(|source| CatalogError::Parse {
                reference: reference.to_string(),
                source,
            })?
        };

        catalog.validate()?;

        let catalog = Arc::new(catalog);
        self.cache
            .lock()
            .expect("catalog cache mutex poisoned")
            .insert(reference.to_string(), Arc::clone(&catalog));
        Ok(catalog)
    }
}

fn scaled(id: &str, prompt: &str, maps_to: ScoringDirective) -> Question {
    Question {
        id: id.to_string(),
        prompt: prompt.to_string(),
        kind: QuestionKind::Scaled,
        options: Vec::new(),
        weight: 1.0,
        maps_to: Some(maps_to),
        dynamic: false,
        required: true,
        min_selections: 0,
        max_selections: 3,
        scale: ScaleBounds::default(),
    }
}

fn single_choice(id: &str, prompt: &str, options: Vec<AnswerOption>) -> Question {
    Question {
        id: id.to_string(),
        prompt: prompt.to_string(),
        kind: QuestionKind::SingleChoice,
        options,
        weight: 1.0,
        maps_to: None,
        dynamic: false,
        required: true,
        min_selections: 0,
        max_selections: 3,
        scale: ScaleBounds::default(),
    }
}

fn standard_catalog() -> AssessmentCatalog {
    let entities = vec![
        EntityDescriptor::new("approval", "Approval", "relational"),
        EntityDescriptor::new("belonging", "Belonging", "relational"),
        EntityDescriptor::new("being_seen", "Being Seen", "relational"),
        EntityDescriptor::new("security", "Security", "material"),
        EntityDescriptor::new("ease", "Ease", "material"),
        EntityDescriptor::new("stimulation", "Stimulation", "experiential"),
    ];

    let gate = PhaseSpec {
        id: "focus".to_string(),
        label: "Focus Selection".to_string(),
        kind: PhaseKind::Gate {
            questions: vec![Question {
                required: false,
                ..single_choice(
                    "gate_focus",
                    "Which area of life feels most strained right now?",
                    vec![
                        AnswerOption::scoped(
                            "Relationships and how others respond to me",
                            ScopeFilter::of(&["relational"]),
                        ),
                        AnswerOption::scoped(
                            "Stability, money, and day-to-day demands",
                            ScopeFilter::of(&["material"]),
                        ),
                        AnswerOption::scoped(
                            "Restlessness and the search for intensity",
                            ScopeFilter::of(&["experiential"]),
                        ),
                        AnswerOption::plain("Hard to say; a bit of everything"),
                    ],
                )
            }],
        },
    };

    let screening = PhaseSpec {
        id: "screening".to_string(),
        label: "Initial Screening".to_string(),
        kind: PhaseKind::Fixed {
            scoped: true,
            questions: vec![
                single_choice(
                    "scr_pull",
                    "When things go wrong, which pull do you notice first?",
                    vec![
                        AnswerOption::scoring(
                            "Checking whether people are still pleased with me",
                            ScoringDirective::new(&["approval"], 3.0, Signal::Compulsion),
                        ),
                        AnswerOption::scoring(
                            "Making sure I am included in whatever happens next",
                            ScoringDirective::new(&["belonging"], 3.0, Signal::Compulsion),
                        ),
                        AnswerOption::scoring(
                            "Recounting events so my side is understood",
                            ScoringDirective::new(&["being_seen"], 3.0, Signal::Compulsion),
                        ),
                        AnswerOption::scoring(
                            "Re-checking accounts, locks, and plans",
                            ScoringDirective::new(&["security"], 3.0, Signal::Compulsion),
                        ),
                        AnswerOption::scoring(
                            "Clearing obligations until nothing is asked of me",
                            ScoringDirective::new(&["ease"], 3.0, Signal::Compulsion),
                        ),
                        AnswerOption::scoring(
                            "Lining up the next plan, trip, or project",
                            ScoringDirective::new(&["stimulation"], 3.0, Signal::Compulsion),
                        ),
                    ],
                ),
                single_choice(
                    "scr_withdraw",
                    "Which situation are you most likely to quietly avoid?",
                    vec![
                        AnswerOption::scoring(
                            "Asking for feedback I might not like",
                            ScoringDirective::new(&["approval"], 3.0, Signal::Aversion),
                        ),
                        AnswerOption::scoring(
                            "Joining a group where I know almost no one",
                            ScoringDirective::new(&["belonging"], 3.0, Signal::Aversion),
                        ),
                        AnswerOption::scoring(
                            "Sharing work before it is polished",
                            ScoringDirective::new(&["being_seen"], 3.0, Signal::Aversion),
                        ),
                        AnswerOption::scoring(
                            "Opening mail that could contain bad financial news",
                            ScoringDirective::new(&["security"], 3.0, Signal::Aversion),
                        ),
                        AnswerOption::scoring(
                            "Committing to anything with a deadline",
                            ScoringDirective::new(&["ease"], 3.0, Signal::Aversion),
                        ),
                        AnswerOption::scoring(
                            "A week with nothing new on the calendar",
                            ScoringDirective::new(&["stimulation"], 3.0, Signal::Aversion),
                        ),
                    ],
                ),
                Question {
                    kind: QuestionKind::MultiSelect,
                    min_selections: 0,
                    max_selections: 3,
                    required: true,
                    ..single_choice(
                        "scr_states",
                        "Which states have visited you most often this month? (up to 3)",
                        vec![
                            AnswerOption::scoring(
                                "Rehearsing conversations after the fact",
                                ScoringDirective::new(
                                    &["approval", "being_seen"],
                                    2.0,
                                    Signal::Alignment,
                                ),
                            ),
                            AnswerOption::scoring(
                                "Feeling like an outsider in familiar rooms",
                                ScoringDirective::new(&["belonging"], 2.0, Signal::Alignment),
                            ),
                            AnswerOption::scoring(
                                "Tallying what is left after every expense",
                                ScoringDirective::new(&["security"], 2.0, Signal::Alignment),
                            ),
                            AnswerOption::scoring(
                                "Postponing small tasks until they become large ones",
                                ScoringDirective::new(&["ease"], 2.0, Signal::Alignment),
                            ),
                            AnswerOption::scoring(
                                "Boredom that feels almost physical",
                                ScoringDirective::new(&["stimulation"], 2.0, Signal::Alignment),
                            ),
                        ],
                    )
                },
                single_choice(
                    "scr_trigger",
                    "Which moment most reliably knocks you off balance?",
                    vec![
                        AnswerOption::scoring(
                            "A message left on read",
                            ScoringDirective::new(&["approval", "belonging"], 2.0, Signal::Trigger),
                        ),
                        AnswerOption::scoring(
                            "Being talked over in a meeting",
                            ScoringDirective::new(&["being_seen"], 2.0, Signal::Trigger),
                        ),
                        AnswerOption::scoring(
                            "An unexpected bill or schedule change",
                            ScoringDirective::new(&["security", "ease"], 2.0, Signal::Trigger),
                        ),
                        AnswerOption::scoring(
                            "A cancelled plan with nothing to replace it",
                            ScoringDirective::new(&["stimulation"], 2.0, Signal::Trigger),
                        ),
                    ],
                ),
                scaled(
                    "scr_history",
                    "Looking back five years, how persistent has your strongest pattern been?",
                    ScoringDirective::new(
                        &[
                            "approval",
                            "belonging",
                            "being_seen",
                            "security",
                            "ease",
                            "stimulation",
                        ],
                        0.5,
                        Signal::Historical,
                    ),
                ),
            ],
        },
    };

    let mut deep_blocks = BTreeMap::new();
    let deep = [
        ("approval", "others' approval"),
        ("belonging", "a place in the group"),
        ("being_seen", "being recognized"),
        ("security", "a sense of safety"),
        ("ease", "relief from demands"),
        ("stimulation", "novelty and intensity"),
    ];
    for (key, phrase) in deep {
        deep_blocks.insert(
            key.to_string(),
            vec![
                scaled(
                    &format!("dd_{key}_urge"),
                    &format!("How strong is the urge to secure {phrase} before you can settle?"),
                    ScoringDirective::new(&[key], 1.0, Signal::Compulsion),
                ),
                scaled(
                    &format!("dd_{key}_history"),
                    &format!("How far back does organizing your choices around {phrase} go?"),
                    ScoringDirective::new(&[key], 1.0, Signal::Historical),
                ),
            ],
        );
    }

    let deep_dive = PhaseSpec {
        id: "deep_dive".to_string(),
        label: "Pattern Deep Dive".to_string(),
        kind: PhaseKind::Adaptive {
            top_n: 2,
            blocks: deep_blocks,
        },
    };

    let integration = PhaseSpec {
        id: "integration".to_string(),
        label: "Integration".to_string(),
        kind: PhaseKind::Fixed {
            scoped: false,
            questions: vec![
                Question {
                    dynamic: true,
                    ..single_choice(
                        "int_chain",
                        "If [PRIMARY_ENTITY] were reliably met tomorrow, what would you reach for next?",
                        vec![
                            AnswerOption::plain("Rest; I would finally stop bracing"),
                            AnswerOption::plain("Connection without keeping score"),
                            AnswerOption::plain("Something new to work toward"),
                            AnswerOption::plain("I honestly do not know"),
                        ],
                    )
                },
                Question {
                    maps_to: None,
                    ..scaled(
                        "int_readiness",
                        "How ready are you to change the pattern this assessment describes?",
                        ScoringDirective::new(&[], 0.0, Signal::Alignment),
                    )
                },
            ],
        },
    };

    let mut refine_blocks = BTreeMap::new();
    for (key, phrase) in deep {
        refine_blocks.insert(
            key.to_string(),
            vec![scaled(
                &format!("ref_{key}"),
                &format!(
                    "When {phrase} and another need conflict, how often does {phrase} win?"
                ),
                ScoringDirective::new(&[key], 2.0, Signal::Compulsion),
            )],
        );
    }

    let refinement = PhaseSpec {
        id: "refinement".to_string(),
        label: "Refinement".to_string(),
        kind: PhaseKind::Refinement {
            blocks: refine_blocks,
        },
    };

    AssessmentCatalog {
        slug: "dependency-patterns".to_string(),
        title: "Dependency Pattern Screener".to_string(),
        entities,
        phases: vec![gate, screening, deep_dive, integration, refinement],
        groups: vec![
            EntityGroup {
                key: "relational_attachment".to_string(),
                label: "Relational Attachment Cluster".to_string(),
                members: vec![
                    "approval".to_string(),
                    "belonging".to_string(),
                    "being_seen".to_string(),
                ],
                threshold: None,
            },
            EntityGroup {
                key: "material_safety".to_string(),
                label: "Material Safety Cluster".to_string(),
                members: vec!["security".to_string(), "ease".to_string()],
                threshold: None,
            },
        ],
        thresholds: None,
    }
}
