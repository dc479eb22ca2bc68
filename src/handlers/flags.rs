//! Flag lifecycle and change-recording handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::engine::ChangeOutcome;
use crate::models::{CreateFlag, FeatureFlag, ImpactPrediction, RecordChange};
use crate::{AppError, AppResult, AppState};

/// List flags, newest-first
pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<FeatureFlag>>> {
    let engine = state.engine.lock().await;
    let flags = FeatureFlag::list(engine.pool()).await?;
    Ok(Json(flags))
}

/// Create a flag; records its `created` change
pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<CreateFlag>,
) -> AppResult<Json<FeatureFlag>> {
    let mut engine = state.engine.lock().await;
    let flag = engine.create_flag(req).await?;
    Ok(Json(flag))
}

/// Get single flag
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<FeatureFlag>> {
    let engine = state.engine.lock().await;
    let flag = FeatureFlag::find_by_id(engine.pool(), id)
        .await?
        .ok_or_else(|| AppError::NotFound("Flag not found".to_string()))?;
    Ok(Json(flag))
}

/// Record a caller-declared change and run the prediction + detection pipeline
pub async fn record_change(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RecordChange>,
) -> AppResult<Json<ChangeOutcome>> {
    let mut engine = state.engine.lock().await;
    let outcome = engine.record_change(id, req).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub flag: FeatureFlag,
    pub prediction: ImpactPrediction,
}

/// Re-run the pipeline against a synthetic change built from current state
pub async fn analyze(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<AnalyzeResponse>> {
    let mut engine = state.engine.lock().await;
    let (flag, outcome) = engine.analyze_flag(id).await?;
    Ok(Json(AnalyzeResponse {
        flag,
        prediction: outcome.prediction,
    }))
}
