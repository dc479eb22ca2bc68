//! Prediction listing handler

use axum::{extract::State, Json};

use crate::models::ImpactPrediction;
use crate::{AppResult, AppState};

/// List current predictions, newest-first by generation time
pub async fn list(State(state): State<AppState>) -> AppResult<Json<Vec<ImpactPrediction>>> {
    let engine = state.engine.lock().await;
    let predictions = ImpactPrediction::list(engine.pool(), 50).await?;
    Ok(Json(predictions))
}
