//! Feature flag model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqlitePool};
use uuid::Uuid;
use validator::Validate;

/// Target environment for a flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub rollout_percentage: i64,
    pub environment: Environment,
    pub owner: String,
    pub tags: Json<Vec<String>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateFlag {
    #[validate(length(min = 1, message = "name must not be empty"))]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub enabled: bool,
    #[validate(range(min = 0, max = 100, message = "rollout percentage must be 0-100"))]
    #[serde(default)]
    pub rollout_percentage: i64,
    pub environment: Environment,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FeatureFlag {
    pub async fn create(pool: &SqlitePool, data: CreateFlag) -> Result<Self, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, FeatureFlag>(
            r#"
            INSERT INTO flags (id, name, description, enabled, rollout_percentage, environment, owner, tags, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&data.name)
        .bind(&data.description)
        .bind(data.enabled)
        .bind(data.rollout_percentage)
        .bind(data.environment)
        .bind(&data.owner)
        .bind(Json(data.tags))
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, FeatureFlag>("SELECT * FROM flags WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, FeatureFlag>("SELECT * FROM flags WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, FeatureFlag>("SELECT * FROM flags ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
    }

    /// Apply a toggle/rollout mutation in place
    pub async fn apply_state(
        pool: &SqlitePool,
        id: Uuid,
        enabled: bool,
        rollout_percentage: i64,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, FeatureFlag>(
            r#"
            UPDATE flags
            SET enabled = ?, rollout_percentage = ?, updated_at = ?
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(enabled)
        .bind(rollout_percentage)
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(pool)
        .await
    }
}
