//! Anomaly model (append-only at detection time)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqlitePool};
use uuid::Uuid;

use super::metrics::ImpactMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AnomalyType {
    ErrorSpike,
    LatencySpike,
    ConversionDrop,
    RollbackRecommended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub flag_name: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    /// The single most-recent sample at detection time, not an aggregate
    pub metrics: Json<ImpactMetrics>,
    pub message: String,
    /// Settable externally; never cleared by the detection path
    pub resolved: bool,
}

#[derive(Debug, Clone)]
pub struct NewAnomaly {
    pub flag_id: Uuid,
    pub flag_name: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub metrics: ImpactMetrics,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct AnomalyFilter {
    pub resolved: Option<bool>,
    pub limit: Option<i64>,
}

impl Anomaly {
    pub async fn insert(pool: &SqlitePool, data: NewAnomaly) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Anomaly>(
            r#"
            INSERT INTO anomalies (id, flag_id, flag_name, anomaly_type, severity, detected_at, metrics, message, resolved)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data.flag_id)
        .bind(&data.flag_name)
        .bind(data.anomaly_type)
        .bind(data.severity)
        .bind(Utc::now())
        .bind(Json(data.metrics))
        .bind(&data.message)
        .fetch_one(pool)
        .await
    }

    /// Newest-first, optionally filtered on the resolved flag
    pub async fn list(pool: &SqlitePool, filter: AnomalyFilter) -> Result<Vec<Self>, sqlx::Error> {
        let limit = filter.limit.unwrap_or(50);

        match filter.resolved {
            Some(resolved) => {
                sqlx::query_as::<_, Anomaly>(
                    "SELECT * FROM anomalies WHERE resolved = ? ORDER BY detected_at DESC, rowid DESC LIMIT ?",
                )
                .bind(resolved)
                .bind(limit)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, Anomaly>(
                    "SELECT * FROM anomalies ORDER BY detected_at DESC, rowid DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(pool)
                .await
            }
        }
    }

    pub async fn unresolved(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Anomaly>(
            "SELECT * FROM anomalies WHERE resolved = 0 ORDER BY detected_at DESC, rowid DESC",
        )
        .fetch_all(pool)
        .await
    }

    /// External resolution mutation; the detector itself never writes this.
    pub async fn resolve(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Anomaly>(
            "UPDATE anomalies SET resolved = 1 WHERE id = ? RETURNING *",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
