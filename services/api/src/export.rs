//! Serialization of completed-run snapshots for download: JSON as stored, or
//! a flat CSV of the ranked entities for spreadsheet work.

use assess_core::assessment::{AnalysisSnapshot, HistoryEntry};
use assess_core::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ExportFormat {
    #[default]
    Json,
    Csv,
}

impl ExportFormat {
    pub(crate) fn parse(raw: Option<&str>) -> Option<Self> {
        match raw {
            None | Some("json") => Some(Self::Json),
            Some("csv") => Some(Self::Csv),
            Some(_) => None,
        }
    }
}

/// The most recent completed run, decoded back into a typed snapshot.
pub(crate) fn latest_snapshot(entries: &[HistoryEntry]) -> Option<AnalysisSnapshot> {
    entries
        .last()
        .and_then(|entry| serde_json::from_value(entry.snapshot.clone()).ok())
}

pub(crate) fn snapshot_csv(snapshot: &AnalysisSnapshot) -> Result<String, AppError> {
    let to_io = |err: csv::Error| {
        AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "entity",
            "band",
            "confidence",
            "total_score",
            "compulsion",
            "aversion",
            "alignment",
            "trigger_match",
            "historical",
        ])
        .map_err(to_io)?;
    for entry in &snapshot.ranked {
        writer
            .write_record([
                entry.entity.clone(),
                entry.band.label().to_string(),
                entry.confidence.label().to_string(),
                format!("{:.2}", entry.total_score),
                format!("{:.2}", entry.bucket.compulsion),
                format!("{:.2}", entry.bucket.aversion),
                format!("{:.2}", entry.bucket.alignment),
                format!("{:.2}", entry.bucket.trigger_match),
                format!("{:.2}", entry.bucket.historical),
            ])
            .map_err(to_io)?;
    }
    let raw = writer
        .into_inner()
        .map_err(|err| AppError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))?;
    String::from_utf8(raw)
        .map_err(|err| AppError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assess_core::assessment::detector::detect;
    use assess_core::assessment::report::build_snapshot;
    use assess_core::assessment::{
        score_all, Answer, AnswerValue, AssessmentCatalog, DetectorThresholds, ScoringWeights,
    };
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn sample_snapshot() -> AnalysisSnapshot {
        let catalog = AssessmentCatalog::standard();
        let thresholds = DetectorThresholds::default();
        let questions: Vec<_> = match &catalog.phases[1].kind {
            assess_core::assessment::PhaseKind::Fixed { questions, .. } => questions.clone(),
            _ => unreachable!(),
        };
        let answers: BTreeMap<String, Answer> = [(
            "scr_pull".to_string(),
            Answer {
                question_id: "scr_pull".to_string(),
                value: AnswerValue::Choice { option: 3 },
                recorded_at: Utc::now(),
            },
        )]
        .into();
        let eligible = catalog.eligible_entities(None);
        let buckets = score_all(questions.iter(), &answers, &eligible);
        let detection = detect(
            &buckets,
            &ScoringWeights::default(),
            &thresholds,
            &catalog.groups,
        );
        build_snapshot(
            &catalog,
            &thresholds,
            &detection,
            &[("Initial Screening".to_string(), questions)],
            &answers,
            Utc::now(),
        )
    }

    #[test]
    fn csv_has_a_row_per_ranked_entity() {
        let snapshot = sample_snapshot();
        let csv = snapshot_csv(&snapshot).expect("csv renders");
        let lines: Vec<&str> = csv.trim().lines().collect();
        assert_eq!(lines.len(), snapshot.ranked.len() + 1);
        assert!(lines[0].starts_with("entity,band,confidence"));
        assert!(lines[1].starts_with("security"));
    }

    #[test]
    fn format_parsing_rejects_unknown_values() {
        assert_eq!(ExportFormat::parse(None), Some(ExportFormat::Json));
        assert_eq!(ExportFormat::parse(Some("csv")), Some(ExportFormat::Csv));
        assert_eq!(ExportFormat::parse(Some("xml")), None);
    }
}
