//! Final analysis assembly: severity, recommendations, and the full answer
//! log that lets a reviewer reconstruct how a conclusion was reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::catalog::{AssessmentCatalog, Question};
use super::detector::{Band, CrossPattern, Detection, DetectorThresholds, RankedEntity};
use super::scoring::{Answer, AnswerValue};

/// Overall severity read off the primary entity's total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Moderate,
    High,
}

impl Severity {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Moderate => "Moderate",
            Self::High => "High",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const fn label(self) -> &'static str {
        match self {
            Self::High => "High",
            Self::Medium => "Medium",
            Self::Low => "Low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub priority: Priority,
    pub summary: String,
    pub detail: String,
}

/// One presented question with whatever was (or was not) answered. Unanswered
/// presented questions are recorded explicitly so skips stay visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerLogEntry {
    pub question_id: String,
    pub phase_label: String,
    pub prompt: String,
    pub answer: Option<AnswerValue>,
}

/// The completed-run report persisted to history and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub assessment: String,
    pub title: String,
    pub completed_at: DateTime<Utc>,
    pub severity: Severity,
    pub severity_label: String,
    pub ranked: Vec<RankedEntity>,
    pub cross_patterns: Vec<CrossPattern>,
    pub recommendations: Vec<Recommendation>,
    pub answer_log: Vec<AnswerLogEntry>,
}

/// Assemble the final snapshot from the last detection run and the presented
/// question history. `thresholds` must be the same effective set the detector
/// ran with, so severity and the detection agree on cutoffs.
pub fn build_snapshot(
    catalog: &AssessmentCatalog,
    thresholds: &DetectorThresholds,
    detection: &Detection,
    presented: &[(String, Vec<Question>)],
    answers: &BTreeMap<String, Answer>,
    completed_at: DateTime<Utc>,
) -> AnalysisSnapshot {
    let severity = severity_of(thresholds, detection);
    AnalysisSnapshot {
        assessment: catalog.slug.clone(),
        title: catalog.title.clone(),
        completed_at,
        severity,
        severity_label: severity.label().to_string(),
        ranked: detection.ranked.clone(),
        cross_patterns: detection.cross_patterns.clone(),
        recommendations: recommendations_for(catalog, thresholds, detection),
        answer_log: answer_log(presented, answers),
    }
}

fn severity_of(thresholds: &DetectorThresholds, detection: &Detection) -> Severity {
    let Some(primary) = detection.primary() else {
        return Severity::Low;
    };
    if primary.total_score >= thresholds.high_threshold {
        Severity::High
    } else if primary.total_score >= thresholds.moderate_threshold {
        Severity::Moderate
    } else {
        Severity::Low
    }
}

/// Turn detection output into prioritized, human-readable guidance.
pub fn recommendations_for(
    catalog: &AssessmentCatalog,
    thresholds: &DetectorThresholds,
    detection: &Detection,
) -> Vec<Recommendation> {
    let mut out = Vec::new();
    let Some(primary) = detection.primary() else {
        return out;
    };

    let primary_label = catalog.entity_label(&primary.entity);
    if primary.band == Band::CoDominant {
        let partner = detection
            .ranked
            .get(1)
            .map(|entry| catalog.entity_label(&entry.entity))
            .unwrap_or(primary_label);
        out.push(Recommendation {
            priority: Priority::High,
            summary: format!("Two patterns lead together: {primary_label} and {partner}"),
            detail: format!(
                "Neither {primary_label} nor {partner} clearly dominates. Track which \
                 one drives your next few difficult moments before choosing where to start."
            ),
        });
    } else {
        out.push(Recommendation {
            priority: Priority::High,
            summary: format!("Start with the {primary_label} pattern"),
            detail: format!(
                "{primary_label} carries your strongest pull ({:.1}, {} confidence). \
                 Notice the moment the urge appears and name it before acting on it.",
                primary.total_score,
                primary.confidence.label()
            ),
        });
    }

    for pattern in &detection.cross_patterns {
        let members: Vec<&str> = pattern
            .members
            .iter()
            .map(|member| catalog.entity_label(member))
            .collect();
        out.push(Recommendation {
            priority: Priority::Medium,
            summary: format!("Linked cluster: {}", pattern.label),
            detail: format!(
                "{} tend to reinforce each other. Working on one usually loosens \
                 the others; treat them as a single system.",
                members.join(", ")
            ),
        });
    }

    for entry in detection
        .ranked
        .iter()
        .filter(|entry| entry.band == Band::Secondary)
        .take(2)
    {
        let label = catalog.entity_label(&entry.entity);
        let strength = if entry.total_score >= thresholds.moderate_threshold {
            "a meaningful pull of its own"
        } else {
            "a weaker but still visible pull"
        };
        out.push(Recommendation {
            priority: Priority::Low,
            summary: format!("Keep an eye on {label}"),
            detail: format!(
                "{label} trails the leading pattern with {strength} ({:.1}). \
                 Revisit it if it grows.",
                entry.total_score
            ),
        });
    }

    out
}

fn answer_log(
    presented: &[(String, Vec<Question>)],
    answers: &BTreeMap<String, Answer>,
) -> Vec<AnswerLogEntry> {
    presented
        .iter()
        .flat_map(|(phase_label, questions)| {
            questions.iter().map(move |question| AnswerLogEntry {
                question_id: question.id.clone(),
                phase_label: phase_label.clone(),
                prompt: question.prompt.clone(),
                answer: answers.get(&question.id).map(|answer| answer.value.clone()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::detector::{detect, DetectorThresholds};
    use crate::assessment::scoring::{ScoreBucket, ScoringWeights};

    fn detection_for(totals: &[(&str, f32)], catalog: &AssessmentCatalog) -> Detection {
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
        detect(
            &buckets,
            &weights,
            &DetectorThresholds::default(),
            &catalog.groups,
        )
    }

    #[test]
    fn severity_tracks_primary_total() {
        let catalog = AssessmentCatalog::standard();
        let thresholds = DetectorThresholds::default();
        let high = detection_for(&[("ease", 7.0)], &catalog);
        let moderate = detection_for(&[("ease", 4.0)], &catalog);
        let low = detection_for(&[("ease", 1.0)], &catalog);
        assert_eq!(severity_of(&thresholds, &high), Severity::High);
        assert_eq!(severity_of(&thresholds, &moderate), Severity::Moderate);
        assert_eq!(severity_of(&thresholds, &low), Severity::Low);
        assert_eq!(severity_of(&thresholds, &Detection::default()), Severity::Low);
    }

    #[test]
    fn severity_follows_the_supplied_thresholds() {
        let catalog = AssessmentCatalog::standard();
        let detection = detection_for(&[("ease", 4.0)], &catalog);
        let lowered = DetectorThresholds {
            high_threshold: 2.0,
            moderate_threshold: 1.0,
            ..DetectorThresholds::default()
        };
        assert_eq!(severity_of(&DetectorThresholds::default(), &detection), Severity::Moderate);
        assert_eq!(severity_of(&lowered, &detection), Severity::High);
    }

    #[test]
    fn primary_recommendation_comes_first() {
        let catalog = AssessmentCatalog::standard();
        let thresholds = DetectorThresholds::default();
        let detection = detection_for(&[("security", 8.0), ("ease", 2.0)], &catalog);
        let recs = recommendations_for(&catalog, &thresholds, &detection);
        assert_eq!(recs[0].priority, Priority::High);
        assert!(recs[0].summary.contains("Security"));
    }

    #[test]
    fn co_dominance_changes_the_lead_recommendation() {
        let catalog = AssessmentCatalog::standard();
        let thresholds = DetectorThresholds::default();
        let detection = detection_for(&[("approval", 6.0), ("stimulation", 5.7)], &catalog);
        let recs = recommendations_for(&catalog, &thresholds, &detection);
        assert!(recs[0].summary.contains("Approval"));
        assert!(recs[0].summary.contains("Stimulation"));
    }

    #[test]
    fn cross_patterns_add_cluster_guidance() {
        let catalog = AssessmentCatalog::standard();
        let thresholds = DetectorThresholds::default();
        let detection = detection_for(&[("security", 8.0), ("ease", 5.0)], &catalog);
        let recs = recommendations_for(&catalog, &thresholds, &detection);
        assert!(recs
            .iter()
            .any(|rec| rec.summary.contains("Material Safety Cluster")));
    }

    #[test]
    fn answer_log_records_skips_explicitly() {
        let catalog = AssessmentCatalog::standard();
        let thresholds = DetectorThresholds::default();
        let detection = detection_for(&[("ease", 5.0)], &catalog);
        let question = Question {
            id: "q1".to_string(),
            prompt: "p".to_string(),
            kind: crate::assessment::catalog::QuestionKind::FreeText,
            options: Vec::new(),
            weight: 1.0,
            maps_to: None,
            dynamic: false,
            required: false,
            min_selections: 0,
            max_selections: 3,
            scale: Default::default(),
        };
        let presented = vec![("Screening".to_string(), vec![question])];
        let snapshot = build_snapshot(
            &catalog,
            &thresholds,
            &detection,
            &presented,
            &BTreeMap::new(),
            Utc::now(),
        );
        assert_eq!(snapshot.answer_log.len(), 1);
        assert!(snapshot.answer_log[0].answer.is_none());
        assert_eq!(snapshot.severity, Severity::Moderate);
    }
}
