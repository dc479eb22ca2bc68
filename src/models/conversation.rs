//! Conversation history model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<Json<serde_json::Value>>,
}

impl ConversationMessage {
    pub async fn append(
        pool: &SqlitePool,
        session_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, ConversationMessage>(
            r#"
            INSERT INTO conversation_messages (id, session_id, role, content, created_at, metadata)
            VALUES (?, ?, ?, ?, ?, NULL)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(Utc::now())
        .fetch_one(pool)
        .await
    }

    /// Last `limit` messages for the session, returned oldest-first
    pub async fn recent(
        pool: &SqlitePool,
        session_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let mut messages = sqlx::query_as::<_, ConversationMessage>(
            "SELECT * FROM conversation_messages WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        messages.reverse();
        Ok(messages)
    }
}
