//! Metrics ingestion handler

use axum::{extract::State, Json};
use serde::Serialize;

use crate::models::{Anomaly, ImpactMetrics, IngestMetrics};
use crate::{AppResult, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub metrics: ImpactMetrics,
    pub anomalies: Vec<Anomaly>,
}

/// Ingest one sample; runs the anomaly scan for that flag
pub async fn ingest(
    State(state): State<AppState>,
    Json(req): Json<IngestMetrics>,
) -> AppResult<Json<IngestResponse>> {
    let mut engine = state.engine.lock().await;
    let (metrics, anomalies) = engine.ingest_metrics(req).await?;
    Ok(Json(IngestResponse { metrics, anomalies }))
}
