use crate::export::{latest_snapshot, snapshot_csv, ExportFormat};
use crate::infra::{AppState, SessionService};
use assess_core::assessment::{
    Advance, AnswerEvent, AnswerValue, HistoryEntry, ProgressUpdate,
};
use assess_core::error::AppError;
use axum::extract::{Path, Query};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
pub(crate) struct StartRequest {
    #[serde(default)]
    pub(crate) catalog: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnswerRequest {
    pub(crate) question_id: String,
    pub(crate) value: AnswerValue,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefinementRequest {
    pub(crate) accept: bool,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct ExportQuery {
    #[serde(default)]
    pub(crate) format: Option<String>,
}

pub(crate) fn with_assessment_routes(service: Arc<SessionService>) -> axum::Router {
    axum::Router::new()
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/assessments/:session/start", post(start_endpoint))
        .route("/api/v1/assessments/:session/resume", post(resume_endpoint))
        .route("/api/v1/assessments/:session/answers", post(answer_endpoint))
        .route("/api/v1/assessments/:session/next", post(next_endpoint))
        .route("/api/v1/assessments/:session/prev", post(prev_endpoint))
        .route(
            "/api/v1/assessments/:session/refinement",
            post(refinement_endpoint),
        )
        .route("/api/v1/assessments/:session/reset", post(reset_endpoint))
        .route(
            "/api/v1/assessments/:session/progress",
            get(progress_endpoint),
        )
        .route(
            "/api/v1/assessments/:session/history",
            get(history_endpoint),
        )
        .route("/api/v1/assessments/:session/export", get(export_endpoint))
        .layer(Extension(service))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub(crate) async fn start_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
    payload: Option<Json<StartRequest>>,
) -> Result<Json<Advance>, AppError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let advance = service.start(&session, request.catalog.as_deref())?;
    Ok(Json(advance))
}

pub(crate) async fn resume_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
    payload: Option<Json<StartRequest>>,
) -> Result<Json<Advance>, AppError> {
    let request = payload.map(|Json(request)| request).unwrap_or_default();
    let advance = service.resume(&session, request.catalog.as_deref())?;
    Ok(Json(advance))
}

pub(crate) async fn answer_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
    Json(payload): Json<AnswerRequest>,
) -> Result<Json<AnswerEvent>, AppError> {
    let event =
        service.with(&session, |engine| engine.answer(&payload.question_id, payload.value))?;
    Ok(Json(event))
}

pub(crate) async fn next_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
) -> Result<Json<Advance>, AppError> {
    Ok(Json(service.with(&session, |engine| engine.next())?))
}

pub(crate) async fn prev_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
) -> Result<Json<Advance>, AppError> {
    Ok(Json(service.with(&session, |engine| engine.prev())?))
}

pub(crate) async fn refinement_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
    Json(payload): Json<RefinementRequest>,
) -> Result<Json<Advance>, AppError> {
    Ok(Json(service.with(&session, |engine| {
        engine.accept_refinement(payload.accept)
    })?))
}

pub(crate) async fn reset_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
) -> Result<StatusCode, AppError> {
    service.with(&session, |engine| engine.reset())?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn progress_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
) -> Result<Json<ProgressUpdate>, AppError> {
    Ok(Json(service.with(&session, |engine| Ok(engine.progress()))?))
}

pub(crate) async fn history_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    Ok(Json(service.history(&session, None)?))
}

pub(crate) async fn export_endpoint(
    Extension(service): Extension<Arc<SessionService>>,
    Path(session): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, AppError> {
    let Some(format) = ExportFormat::parse(query.format.as_deref()) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "format must be 'json' or 'csv'" })),
        )
            .into_response());
    };

    let entries = service.history(&session, None)?;
    let Some(snapshot) = latest_snapshot(&entries) else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no completed runs for this session" })),
        )
            .into_response());
    };

    let response = match format {
        ExportFormat::Json => Json(snapshot).into_response(),
        ExportFormat::Csv => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/csv")],
            snapshot_csv(&snapshot)?,
        )
            .into_response(),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assess_core::assessment::EngineConfig;

    fn service() -> Arc<SessionService> {
        Arc::new(SessionService::new(EngineConfig::default()))
    }

    fn status_of(advance: &Advance) -> String {
        serde_json::to_value(advance).expect("advance serializes")["status"]
            .as_str()
            .expect("tagged status")
            .to_string()
    }

    #[tokio::test]
    async fn healthcheck_reports_ok() {
        let Json(body) = healthcheck().await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn start_presents_the_first_question() {
        let service = service();
        let Json(advance) = start_endpoint(
            Extension(service),
            Path("participant-1".to_string()),
            None,
        )
        .await
        .expect("run starts");
        assert_eq!(status_of(&advance), "question");
    }

    #[tokio::test]
    async fn answers_flow_through_the_session() {
        let service = service();
        start_endpoint(
            Extension(service.clone()),
            Path("participant-1".to_string()),
            None,
        )
        .await
        .expect("run starts");

        let Json(event) = answer_endpoint(
            Extension(service.clone()),
            Path("participant-1".to_string()),
            Json(AnswerRequest {
                question_id: "gate_focus".to_string(),
                value: AnswerValue::Choice { option: 0 },
            }),
        )
        .await
        .expect("answer accepted");
        assert_eq!(event.question_id, "gate_focus");

        let Json(advance) =
            next_endpoint(Extension(service), Path("participant-1".to_string()))
                .await
                .expect("advances");
        assert_eq!(status_of(&advance), "question");
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let service = service();
        let err = next_endpoint(Extension(service), Path("ghost".to_string()))
            .await
            .expect_err("no such session");
        assert!(matches!(err, AppError::Engine(_)));
    }

    #[tokio::test]
    async fn export_without_history_is_not_found() {
        let service = service();
        start_endpoint(
            Extension(service.clone()),
            Path("participant-1".to_string()),
            None,
        )
        .await
        .expect("run starts");
        let response = export_endpoint(
            Extension(service),
            Path("participant-1".to_string()),
            Query(ExportQuery::default()),
        )
        .await
        .expect("handler responds");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
