//! Terminal walkthrough of a complete assessment run, including a simulated
//! interruption and resume, ending with the printed analysis.

use assess_core::assessment::catalog::STANDARD_CATALOG;
use assess_core::assessment::{
    Advance, AnalysisSnapshot, AnswerValue, AssessmentCatalog, AssessmentEngine, CatalogLoader,
    EngineConfig, InMemoryProgressStore, Question, QuestionKind,
};
use assess_core::error::AppError;
use clap::Args;
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Catalog reference: a JSON file path, or "standard" for the built-in
    #[arg(long, default_value = STANDARD_CATALOG)]
    pub(crate) catalog: String,
    /// Decline the refinement questions when they are offered
    #[arg(long)]
    pub(crate) decline_refinement: bool,
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let loader = CatalogLoader::new();
    let catalog = loader.load(&args.catalog)?;
    let store = InMemoryProgressStore::new();
    let config = EngineConfig::default();

    let mut engine = AssessmentEngine::new(
        Arc::clone(&catalog),
        config.clone(),
        store.clone(),
        "demo",
    );

    println!("== {} ==", catalog.title);
    let mut advance = engine.start()?;
    let mut answered = 0usize;
    let mut interrupted = false;

    loop {
        match advance {
            Advance::Question(request) => {
                println!("[{}] {}", request.phase_label, request.question.prompt);
                if let Some(value) = scripted_answer(&request.question) {
                    println!("   -> {}", describe(&request.question, &value));
                    engine.answer(&request.question.id, value)?;
                } else {
                    println!("   -> (skipped)");
                }
                advance = engine.next()?;
                answered += 1;

                if answered == 4 && !interrupted {
                    interrupted = true;
                    println!("-- interruption: rebuilding the engine from saved progress --");
                    engine = AssessmentEngine::new(
                        Arc::clone(&catalog),
                        config.clone(),
                        store.clone(),
                        "demo",
                    );
                    advance = engine.resume()?;
                }
            }
            Advance::RefinementOffered { targets } => {
                let labels: Vec<&str> = targets
                    .iter()
                    .map(|key| catalog.entity_label(key))
                    .collect();
                println!("-- refinement offered for: {} --", labels.join(", "));
                advance = engine.accept_refinement(!args.decline_refinement)?;
            }
            Advance::Complete(snapshot) => {
                print_snapshot(&catalog, &snapshot);
                return Ok(());
            }
        }
    }
}

/// Deterministic answers that exercise every question kind.
fn scripted_answer(question: &Question) -> Option<AnswerValue> {
    match question.kind {
        QuestionKind::SingleChoice => Some(AnswerValue::Choice { option: 0 }),
        QuestionKind::MultiSelect => {
            let take = question
                .options
                .len()
                .min(question.max_selections as usize)
                .min(2);
            if take < question.min_selections as usize {
                return None;
            }
            Some(AnswerValue::Selections {
                options: (0..take).collect(),
            })
        }
        QuestionKind::Scaled => Some(AnswerValue::Scale {
            value: 6.0f32.clamp(question.scale.min, question.scale.max),
        }),
        QuestionKind::Ranked => Some(AnswerValue::Ranking {
            options: (0..question.options.len()).collect(),
        }),
        QuestionKind::FreeText => Some(AnswerValue::Text {
            value: "noted".to_string(),
        }),
    }
}

fn describe(question: &Question, value: &AnswerValue) -> String {
    match value {
        AnswerValue::Choice { option } => question
            .options
            .get(*option)
            .map(|opt| opt.label.clone())
            .unwrap_or_else(|| format!("option {option}")),
        AnswerValue::Selections { options } => options
            .iter()
            .filter_map(|index| question.options.get(*index))
            .map(|opt| opt.label.clone())
            .collect::<Vec<_>>()
            .join("; "),
        AnswerValue::Scale { value } => format!("{value:.0} on the scale"),
        AnswerValue::Ranking { options } => format!("ranked {} options", options.len()),
        AnswerValue::Text { value } => value.clone(),
    }
}

fn print_snapshot(catalog: &AssessmentCatalog, snapshot: &AnalysisSnapshot) {
    println!();
    println!("== {} : {} severity ==", snapshot.title, snapshot.severity_label);
    println!("{:<14} {:>7}  {:<12} {}", "entity", "score", "band", "confidence");
    for entry in &snapshot.ranked {
        println!(
            "{:<14} {:>7.2}  {:<12} {}",
            catalog.entity_label(&entry.entity),
            entry.total_score,
            entry.band.label(),
            entry.confidence.label()
        );
    }
    if !snapshot.cross_patterns.is_empty() {
        println!();
        for pattern in &snapshot.cross_patterns {
            let members: Vec<&str> = pattern
                .members
                .iter()
                .map(|member| catalog.entity_label(member))
                .collect();
            println!("cross-pattern: {} ({})", pattern.label, members.join(", "));
        }
    }
    println!();
    for recommendation in &snapshot.recommendations {
        println!(
            "[{}] {}",
            recommendation.priority.label(),
            recommendation.summary
        );
        println!("      {}", recommendation.detail);
    }
    println!();
    println!(
        "{} questions presented, {} answered",
        snapshot.answer_log.len(),
        snapshot
            .answer_log
            .iter()
            .filter(|entry| entry.answer.is_some())
            .count()
    );
}
