//! Anomaly listing and resolution handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use uuid::Uuid;

use crate::models::{Anomaly, AnomalyFilter};
use crate::{AppError, AppResult, AppState};

/// List anomalies, newest-first
pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<AnomalyFilter>,
) -> AppResult<Json<Vec<Anomaly>>> {
    let engine = state.engine.lock().await;
    let anomalies = Anomaly::list(engine.pool(), filter).await?;
    Ok(Json(anomalies))
}

/// Mark an anomaly resolved (external mutation; the detector never clears it)
pub async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Anomaly>> {
    let engine = state.engine.lock().await;
    let anomaly = Anomaly::resolve(engine.pool(), id)
        .await?
        .ok_or_else(|| AppError::NotFound("Anomaly not found".to_string()))?;
    Ok(Json(anomaly))
}
