//! Flag change log model (append-only)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqlitePool};
use uuid::Uuid;

use super::flag::Environment;

/// Declared by the caller; never inferred from the snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Enabled,
    Disabled,
    RolloutChanged,
    Deleted,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Enabled => "enabled",
            ChangeType::Disabled => "disabled",
            ChangeType::RolloutChanged => "rollout_changed",
            ChangeType::Deleted => "deleted",
        }
    }
}

/// The known flag-state snapshot shape. Anything else rides through
/// [`ValueSnapshot::Other`] untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlagState {
    pub enabled: bool,
    pub rollout_percentage: i64,
}

/// Previous/new value snapshots are opaque to the detector and the
/// prediction engine; only the flag handlers interpret the known shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSnapshot {
    Flag(FlagState),
    Other(serde_json::Value),
}

impl ValueSnapshot {
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            ValueSnapshot::Flag(state) => {
                serde_json::to_value(state).unwrap_or(serde_json::Value::Null)
            }
            ValueSnapshot::Other(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FlagChange {
    pub id: Uuid,
    pub flag_id: Uuid,
    pub flag_name: String,
    pub change_type: ChangeType,
    pub previous_value: Option<Json<serde_json::Value>>,
    pub new_value: Json<serde_json::Value>,
    pub actor: String,
    pub environment: Environment,
    pub created_at: DateTime<Utc>,
}

/// A caller-declared change to record against a flag
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordChange {
    pub change_type: ChangeType,
    pub previous_value: Option<ValueSnapshot>,
    pub new_value: ValueSnapshot,
    #[serde(default)]
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct NewChange {
    pub flag_id: Uuid,
    pub flag_name: String,
    pub change_type: ChangeType,
    pub previous_value: Option<serde_json::Value>,
    pub new_value: serde_json::Value,
    pub actor: String,
    pub environment: Environment,
}

impl FlagChange {
    pub async fn create(pool: &SqlitePool, data: NewChange) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, FlagChange>(
            r#"
            INSERT INTO flag_changes (id, flag_id, flag_name, change_type, previous_value, new_value, actor, environment, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data.flag_id)
        .bind(&data.flag_name)
        .bind(data.change_type)
        .bind(data.previous_value.map(Json))
        .bind(Json(data.new_value))
        .bind(&data.actor)
        .bind(data.environment)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    /// Newest-first change history for one flag
    pub async fn recent_for_flag(
        pool: &SqlitePool,
        flag_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, FlagChange>(
            "SELECT * FROM flag_changes WHERE flag_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(flag_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, FlagChange>(
            "SELECT * FROM flag_changes ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}
