//! Database module - SQLite connection and schema bootstrap

use std::str::FromStr;

use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

/// Create database connection pool
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Apply the schema (idempotent)
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;

    tracing::info!("Database schema applied successfully");
    Ok(())
}

/// Database schema SQL
const SCHEMA_SQL: &str = r#"
-- Feature flags
CREATE TABLE IF NOT EXISTS flags (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 0,
    rollout_percentage INTEGER NOT NULL DEFAULT 0,
    environment TEXT NOT NULL DEFAULT 'development',
    owner TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Flag change log (append-only)
CREATE TABLE IF NOT EXISTS flag_changes (
    id TEXT PRIMARY KEY,
    flag_id TEXT NOT NULL,
    flag_name TEXT NOT NULL,
    change_type TEXT NOT NULL,
    previous_value TEXT,
    new_value TEXT NOT NULL,
    actor TEXT NOT NULL,
    environment TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Impact metrics samples (append-only)
CREATE TABLE IF NOT EXISTS impact_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    flag_id TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    error_rate REAL NOT NULL,
    latency_p50 REAL NOT NULL,
    latency_p99 REAL NOT NULL,
    request_count INTEGER NOT NULL,
    conversion_rate REAL NOT NULL,
    satisfaction_score REAL NOT NULL
);

-- Impact predictions (one current row per flag, latest-wins)
CREATE TABLE IF NOT EXISTS predictions (
    flag_id TEXT PRIMARY KEY,
    risk_level TEXT NOT NULL,
    risk_score REAL NOT NULL,
    error_rate_change REAL NOT NULL,
    latency_change REAL NOT NULL,
    affected_user_percentage REAL NOT NULL,
    recommendations TEXT NOT NULL,
    reasoning TEXT NOT NULL,
    confidence REAL NOT NULL,
    generated_at TEXT NOT NULL
);

-- Anomalies (append-only at detection time)
CREATE TABLE IF NOT EXISTS anomalies (
    id TEXT PRIMARY KEY,
    flag_id TEXT NOT NULL,
    flag_name TEXT NOT NULL,
    anomaly_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    detected_at TEXT NOT NULL,
    metrics TEXT NOT NULL,
    message TEXT NOT NULL,
    resolved INTEGER NOT NULL DEFAULT 0
);

-- Conversation history
CREATE TABLE IF NOT EXISTS conversation_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    metadata TEXT
);

-- Indexes
CREATE INDEX IF NOT EXISTS idx_changes_flag ON flag_changes(flag_id, created_at);
CREATE INDEX IF NOT EXISTS idx_metrics_flag ON impact_metrics(flag_id, recorded_at);
CREATE INDEX IF NOT EXISTS idx_anomalies_detected ON anomalies(detected_at);
CREATE INDEX IF NOT EXISTS idx_anomalies_resolved ON anomalies(resolved);
CREATE INDEX IF NOT EXISTS idx_conversation_session ON conversation_messages(session_id, created_at);
"#;

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
