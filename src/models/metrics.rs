//! Impact metrics samples (append-only time series)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImpactMetrics {
    pub id: i64,
    pub flag_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    /// Error rate as a percentage
    pub error_rate: f64,
    /// Median latency in milliseconds
    pub latency_p50: f64,
    pub latency_p99: f64,
    pub request_count: i64,
    pub conversion_rate: f64,
    pub satisfaction_score: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngestMetrics {
    pub flag_id: Uuid,
    /// Defaults to the ingestion time when omitted
    pub recorded_at: Option<DateTime<Utc>>,
    pub error_rate: f64,
    pub latency_p50: f64,
    pub latency_p99: f64,
    #[validate(range(min = 0, message = "request count must be non-negative"))]
    pub request_count: i64,
    #[serde(default)]
    pub conversion_rate: f64,
    #[serde(default)]
    pub satisfaction_score: f64,
}

impl ImpactMetrics {
    pub async fn insert(pool: &SqlitePool, data: IngestMetrics) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, ImpactMetrics>(
            r#"
            INSERT INTO impact_metrics (flag_id, recorded_at, error_rate, latency_p50, latency_p99, request_count, conversion_rate, satisfaction_score)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(data.flag_id)
        .bind(data.recorded_at.unwrap_or_else(Utc::now))
        .bind(data.error_rate)
        .bind(data.latency_p50)
        .bind(data.latency_p99)
        .bind(data.request_count)
        .bind(data.conversion_rate)
        .bind(data.satisfaction_score)
        .fetch_one(pool)
        .await
    }

    /// Newest-first samples for one flag
    pub async fn recent_for_flag(
        pool: &SqlitePool,
        flag_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ImpactMetrics>(
            "SELECT * FROM impact_metrics WHERE flag_id = ? ORDER BY recorded_at DESC, id DESC LIMIT ?",
        )
        .bind(flag_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
