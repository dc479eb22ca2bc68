//! Impact prediction model (one current row per flag, latest-wins)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqlitePool};
use uuid::Uuid;

/// Ordered risk classification: low < medium < high < critical
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Signed predicted deltas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImpactDeltas {
    pub error_rate_change: f64,
    pub latency_change: f64,
    pub affected_user_percentage: f64,
}

impl ImpactDeltas {
    pub const ZERO: ImpactDeltas = ImpactDeltas {
        error_rate_change: 0.0,
        latency_change: 0.0,
        affected_user_percentage: 0.0,
    };
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImpactPrediction {
    pub flag_id: Uuid,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    #[sqlx(flatten)]
    pub predicted_impact: ImpactDeltas,
    pub recommendations: Json<Vec<String>>,
    pub reasoning: String,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPrediction {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub predicted_impact: ImpactDeltas,
    pub recommendations: Vec<String>,
    pub reasoning: String,
    pub confidence: f64,
}

impl ImpactPrediction {
    /// Replace any prior prediction for the flag (no history retained)
    pub async fn upsert(
        pool: &SqlitePool,
        flag_id: Uuid,
        data: NewPrediction,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, ImpactPrediction>(
            r#"
            INSERT INTO predictions (flag_id, risk_level, risk_score, error_rate_change, latency_change, affected_user_percentage, recommendations, reasoning, confidence, generated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (flag_id) DO UPDATE SET
                risk_level = excluded.risk_level,
                risk_score = excluded.risk_score,
                error_rate_change = excluded.error_rate_change,
                latency_change = excluded.latency_change,
                affected_user_percentage = excluded.affected_user_percentage,
                recommendations = excluded.recommendations,
                reasoning = excluded.reasoning,
                confidence = excluded.confidence,
                generated_at = excluded.generated_at
            RETURNING *
            "#,
        )
        .bind(flag_id)
        .bind(data.risk_level)
        .bind(data.risk_score)
        .bind(data.predicted_impact.error_rate_change)
        .bind(data.predicted_impact.latency_change)
        .bind(data.predicted_impact.affected_user_percentage)
        .bind(Json(data.recommendations))
        .bind(data.reasoning)
        .bind(data.confidence)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_flag(pool: &SqlitePool, flag_id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, ImpactPrediction>("SELECT * FROM predictions WHERE flag_id = ?")
            .bind(flag_id)
            .fetch_optional(pool)
            .await
    }

    /// Newest-first by generation time
    pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, ImpactPrediction>(
            "SELECT * FROM predictions ORDER BY generated_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
