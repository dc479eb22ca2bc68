//! Conversational assistant
//!
//! Per-session message history with a live system-state summary injected
//! into the system prompt. Reads the other stores, never writes them.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::engine::llm::{ChatMessage, ChatRole, CompletionOptions, LlmClient, LlmError};
use crate::models::{Anomaly, ConversationMessage, FeatureFlag, ImpactPrediction, Role};

pub const CHAT_TEMPERATURE: f32 = 0.7;
pub const CHAT_MAX_TOKENS: u32 = 512;

/// How many session messages are replayed as conversational context
pub const CONTEXT_MESSAGES: i64 = 10;

/// How many recent predictions the state summary mentions
const SUMMARY_PREDICTIONS: i64 = 3;

const APOLOGY: &str =
    "I'm sorry, I'm having trouble responding right now. Please try again in a moment.";

/// Best-effort reply: on model failure the fixed apology is appended and
/// returned like any other assistant message.
pub async fn respond(
    pool: &SqlitePool,
    llm: &dyn LlmClient,
    session_id: Uuid,
    message: &str,
) -> Result<String, sqlx::Error> {
    ConversationMessage::append(pool, session_id, Role::User, message).await?;

    let history = ConversationMessage::recent(pool, session_id, CONTEXT_MESSAGES).await?;
    let summary = state_summary(pool).await?;

    let mut messages = vec![ChatMessage::system(system_prompt(&summary))];
    for entry in &history {
        messages.push(ChatMessage {
            role: chat_role(entry.role),
            content: entry.content.clone(),
        });
    }

    let options = CompletionOptions {
        temperature: CHAT_TEMPERATURE,
        max_tokens: CHAT_MAX_TOKENS,
    };

    let reply = match llm.complete(&messages, options).await {
        Ok(text) => text,
        Err(LlmError(e)) => {
            tracing::warn!(%session_id, "Chat completion failed: {}", e);
            APOLOGY.to_string()
        }
    };

    ConversationMessage::append(pool, session_id, Role::Assistant, &reply).await?;
    Ok(reply)
}

fn chat_role(role: Role) -> ChatRole {
    match role {
        Role::User => ChatRole::User,
        Role::Assistant => ChatRole::Assistant,
        Role::System => ChatRole::System,
    }
}

fn system_prompt(summary: &str) -> String {
    format!(
        "You are an assistant for a feature flag monitoring system. Answer questions \
         about flags, their recent changes, detected anomalies and risk predictions. \
         Be concise and concrete.\n\nCurrent system state:\n{}",
        summary
    )
}

/// Live summary of flags, unresolved anomalies and recent predictions
async fn state_summary(pool: &SqlitePool) -> Result<String, sqlx::Error> {
    let flags = FeatureFlag::list(pool).await?;
    let anomalies = Anomaly::unresolved(pool).await?;
    let predictions = ImpactPrediction::list(pool, SUMMARY_PREDICTIONS).await?;

    let mut summary = format!("Flags ({}):\n", flags.len());
    for flag in &flags {
        summary.push_str(&format!(
            "- {}: {} at {}% rollout\n",
            flag.name,
            if flag.enabled { "enabled" } else { "disabled" },
            flag.rollout_percentage
        ));
    }

    summary.push_str(&format!("\nActive anomalies ({}):\n", anomalies.len()));
    for anomaly in &anomalies {
        summary.push_str(&format!("- [{}] {}\n", anomaly.flag_name, anomaly.message));
    }

    summary.push_str("\nRecent predictions:\n");
    for prediction in &predictions {
        summary.push_str(&format!(
            "- flag {}: {} risk\n",
            prediction.flag_id,
            prediction.risk_level.as_str()
        ));
    }

    Ok(summary)
}
