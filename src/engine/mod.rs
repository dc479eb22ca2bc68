//! Core pipeline
//!
//! All mutating operations flow through one [`Engine`] value held behind a
//! single `tokio::sync::Mutex` (see `AppState`): at most one logical
//! operation runs against the shared store at a time, including across the
//! language-model await. A slow model call delays, but cannot interleave
//! with, subsequent operations on the same state.

pub mod broadcast;
pub mod chat;
pub mod detector;
pub mod llm;
pub mod prediction;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{
    Anomaly, ChangeType, CreateFlag, FeatureFlag, FlagChange, ImpactMetrics, ImpactPrediction,
    IngestMetrics, NewChange, NewPrediction, RecordChange, ValueSnapshot,
};

use broadcast::{ServerEvent, SessionRegistry};
use llm::LlmClient;

/// Historical samples supplied to the prediction engine
pub const HISTORY_LIMIT: i64 = 100;

/// Prior changes supplied to the prediction engine
pub const RECENT_CHANGES_LIMIT: i64 = 20;

/// Result of running the full change pipeline
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeOutcome {
    pub change: FlagChange,
    pub prediction: ImpactPrediction,
    pub anomalies: Vec<Anomaly>,
}

pub struct Engine {
    pool: SqlitePool,
    llm: Box<dyn LlmClient>,
    pub sessions: SessionRegistry,
}

impl Engine {
    pub fn new(pool: SqlitePool, llm: Box<dyn LlmClient>) -> Self {
        Self {
            pool,
            llm,
            sessions: SessionRegistry::default(),
        }
    }

    /// Read access for listing handlers; mutations go through the methods below.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a flag; writes exactly one `created` change record (with a null
    /// previous value) and broadcasts flag-created.
    pub async fn create_flag(&mut self, req: CreateFlag) -> AppResult<FeatureFlag> {
        req.validate()?;
        if FeatureFlag::find_by_name(&self.pool, &req.name).await?.is_some() {
            return Err(AppError::AlreadyExists(format!(
                "Flag '{}' already exists",
                req.name
            )));
        }

        let flag = FeatureFlag::create(&self.pool, req).await?;
        FlagChange::create(
            &self.pool,
            NewChange {
                flag_id: flag.id,
                flag_name: flag.name.clone(),
                change_type: ChangeType::Created,
                previous_value: None,
                new_value: serde_json::to_value(&flag)?,
                actor: flag.owner.clone(),
                environment: flag.environment,
            },
        )
        .await?;

        tracing::info!(flag = %flag.name, "Flag created");
        self.sessions.broadcast(&ServerEvent::FlagCreated { flag: flag.clone() });
        Ok(flag)
    }

    /// Record a caller-declared change, then run prediction + detection.
    ///
    /// When the new value carries the known flag-state shape it is applied to
    /// the stored flag; any other snapshot rides through opaque.
    pub async fn record_change(
        &mut self,
        flag_id: Uuid,
        req: RecordChange,
    ) -> AppResult<ChangeOutcome> {
        let flag = FeatureFlag::find_by_id(&self.pool, flag_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Flag not found".to_string()))?;

        // Prior history, fetched before the new change is appended
        let prior_changes =
            FlagChange::recent_for_flag(&self.pool, flag.id, RECENT_CHANGES_LIMIT).await?;

        let flag = match &req.new_value {
            ValueSnapshot::Flag(state) => {
                FeatureFlag::apply_state(&self.pool, flag.id, state.enabled, state.rollout_percentage)
                    .await?
                    .unwrap_or(flag)
            }
            ValueSnapshot::Other(_) => flag,
        };

        let change = FlagChange::create(
            &self.pool,
            NewChange {
                flag_id: flag.id,
                flag_name: flag.name.clone(),
                change_type: req.change_type,
                previous_value: req.previous_value.as_ref().map(ValueSnapshot::to_value),
                new_value: req.new_value.to_value(),
                actor: req.actor,
                environment: flag.environment,
            },
        )
        .await?;

        self.run_pipeline(&flag, change, &prior_changes).await
    }

    /// Synthesize an `enabled` change from the flag's current stored state and
    /// run the same pipeline as a live change.
    pub async fn analyze_flag(&mut self, flag_id: Uuid) -> AppResult<(FeatureFlag, ChangeOutcome)> {
        let flag = FeatureFlag::find_by_id(&self.pool, flag_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Flag not found".to_string()))?;

        let prior_changes =
            FlagChange::recent_for_flag(&self.pool, flag.id, RECENT_CHANGES_LIMIT).await?;
        let snapshot = serde_json::to_value(&flag)?;

        let change = FlagChange::create(
            &self.pool,
            NewChange {
                flag_id: flag.id,
                flag_name: flag.name.clone(),
                change_type: ChangeType::Enabled,
                previous_value: Some(snapshot.clone()),
                new_value: snapshot,
                actor: "system".to_string(),
                environment: flag.environment,
            },
        )
        .await?;

        let outcome = self.run_pipeline(&flag, change, &prior_changes).await?;
        Ok((flag, outcome))
    }

    /// Ingest one metrics sample and scan for anomalies on that flag.
    pub async fn ingest_metrics(
        &mut self,
        req: IngestMetrics,
    ) -> AppResult<(ImpactMetrics, Vec<Anomaly>)> {
        req.validate()?;
        let flag = FeatureFlag::find_by_id(&self.pool, req.flag_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Flag not found".to_string()))?;

        let sample = ImpactMetrics::insert(&self.pool, req).await?;
        let anomalies = detector::detect(&self.pool, &flag).await?;
        for anomaly in &anomalies {
            self.sessions
                .broadcast(&ServerEvent::AnomalyDetected { anomaly: anomaly.clone() });
        }
        Ok((sample, anomalies))
    }

    /// Conversational assistant entry point; best-effort, never a hard failure.
    pub async fn chat(&mut self, session_id: Uuid, message: &str) -> AppResult<String> {
        let reply = chat::respond(&self.pool, self.llm.as_ref(), session_id, message).await?;
        Ok(reply)
    }

    pub fn register_session(&mut self, sender: UnboundedSender<ServerEvent>) -> Uuid {
        self.sessions.register(sender)
    }

    pub fn unregister_session(&mut self, session_id: Uuid) {
        self.sessions.unregister(session_id);
    }

    pub fn send_to_session(&self, session_id: Uuid, event: ServerEvent) {
        self.sessions.send_to(session_id, event);
    }

    /// change log write -> prediction -> detector scan -> fan-out
    async fn run_pipeline(
        &mut self,
        flag: &FeatureFlag,
        change: FlagChange,
        prior_changes: &[FlagChange],
    ) -> AppResult<ChangeOutcome> {
        let history = ImpactMetrics::recent_for_flag(&self.pool, flag.id, HISTORY_LIMIT).await?;
        let outcome =
            prediction::predict(self.llm.as_ref(), &change, &history, prior_changes).await;

        let prediction = ImpactPrediction::upsert(
            &self.pool,
            flag.id,
            NewPrediction {
                risk_level: outcome.risk_level,
                risk_score: outcome.risk_score,
                predicted_impact: outcome.predicted_impact,
                recommendations: outcome.recommendations,
                reasoning: outcome.reasoning,
                confidence: outcome.confidence,
            },
        )
        .await?;

        let anomalies = detector::detect(&self.pool, flag).await?;

        self.sessions.broadcast(&ServerEvent::FlagChanged {
            change: change.clone(),
            prediction: prediction.clone(),
        });
        for anomaly in &anomalies {
            self.sessions
                .broadcast(&ServerEvent::AnomalyDetected { anomaly: anomaly.clone() });
        }

        Ok(ChangeOutcome {
            change,
            prediction,
            anomalies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::engine::llm::{ChatMessage, CompletionOptions, LlmError};
    use crate::models::{AnomalyFilter, AnomalyType, ConversationMessage, Environment, FlagState, RiskLevel, Role, Severity};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockLlm {
        replies: Mutex<VecDeque<Result<String, String>>>,
    }

    impl MockLlm {
        fn scripted(replies: Vec<Result<&str, &str>>) -> Box<Self> {
            Box::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _options: CompletionOptions,
        ) -> Result<String, LlmError> {
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(text),
                Some(Err(e)) => Err(LlmError(e)),
                None => Err(LlmError("no scripted reply".to_string())),
            }
        }
    }

    fn model_json(risk: &str, score: f64, confidence: f64) -> String {
        format!(
            r#"{{"riskLevel":"{}","riskScore":{},"predictedImpact":{{"errorRateChange":0.5,"latencyChange":10.0,"affectedUserPercentage":25.0}},"recommendations":["Watch dashboards"],"reasoning":"scripted","confidence":{}}}"#,
            risk, score, confidence
        )
    }

    async fn engine_with(replies: Vec<Result<&str, &str>>) -> Engine {
        let pool = db::test_pool().await;
        Engine::new(pool, MockLlm::scripted(replies))
    }

    fn create_request(name: &str) -> CreateFlag {
        CreateFlag {
            name: name.to_string(),
            description: "test flag".to_string(),
            enabled: false,
            rollout_percentage: 10,
            environment: Environment::Production,
            owner: "alice".to_string(),
            tags: vec!["checkout".to_string()],
        }
    }

    fn toggle_on() -> RecordChange {
        RecordChange {
            change_type: ChangeType::Enabled,
            previous_value: Some(ValueSnapshot::Flag(FlagState {
                enabled: false,
                rollout_percentage: 10,
            })),
            new_value: ValueSnapshot::Flag(FlagState {
                enabled: true,
                rollout_percentage: 10,
            }),
            actor: "alice".to_string(),
        }
    }

    fn metrics(flag_id: Uuid, error_rate: f64, offset_secs: i64) -> IngestMetrics {
        IngestMetrics {
            flag_id,
            recorded_at: Some(Utc::now() + Duration::seconds(offset_secs)),
            error_rate,
            latency_p50: 50.0,
            latency_p99: 120.0,
            request_count: 1000,
            conversion_rate: 3.0,
            satisfaction_score: 4.0,
        }
    }

    #[tokio::test]
    async fn creating_a_flag_records_one_created_change() {
        let mut engine = engine_with(vec![]).await;
        let flag = engine.create_flag(create_request("checkout-v2")).await.unwrap();

        let changes = FlagChange::recent_for_flag(engine.pool(), flag.id, 10)
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Created);
        assert!(changes[0].previous_value.is_none());
    }

    #[tokio::test]
    async fn duplicate_flag_name_is_a_conflict() {
        let mut engine = engine_with(vec![]).await;
        engine.create_flag(create_request("dup")).await.unwrap();
        let err = engine.create_flag(create_request("dup")).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn invalid_rollout_percentage_is_rejected() {
        let mut engine = engine_with(vec![]).await;
        let mut req = create_request("bad");
        req.rollout_percentage = 120;
        let err = engine.create_flag(req).await.unwrap_err();
        assert!(matches!(err, AppError::ValidationError(_)));
    }

    #[tokio::test]
    async fn model_failure_yields_low_confidence_fallback() {
        let mut engine = engine_with(vec![Err("connection refused")]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        let outcome = engine.record_change(flag.id, toggle_on()).await.unwrap();
        assert_eq!(outcome.prediction.risk_level, RiskLevel::Medium);
        assert_eq!(outcome.prediction.risk_score, 50.0);
        assert_eq!(outcome.prediction.confidence, 0.3);
        assert_eq!(
            outcome.prediction.recommendations.0,
            vec!["Manual review recommended due to analysis error".to_string()]
        );
    }

    #[tokio::test]
    async fn unparseable_model_output_yields_medium_confidence_fallback() {
        let mut engine = engine_with(vec![Ok("the risk is probably fine")]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        let outcome = engine.record_change(flag.id, toggle_on()).await.unwrap();
        assert_eq!(outcome.prediction.confidence, 0.5);
        assert_eq!(
            outcome.prediction.recommendations.0,
            vec!["Monitor closely after deployment".to_string()]
        );
    }

    #[tokio::test]
    async fn well_formed_model_output_is_stored() {
        let reply = model_json("high", 72.0, 0.8);
        let mut engine = engine_with(vec![Ok(reply.as_str())]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        let outcome = engine.record_change(flag.id, toggle_on()).await.unwrap();
        assert_eq!(outcome.prediction.risk_level, RiskLevel::High);
        assert_eq!(outcome.prediction.risk_score, 72.0);
        assert_eq!(outcome.prediction.predicted_impact.affected_user_percentage, 25.0);
    }

    #[tokio::test]
    async fn out_of_range_model_numerics_are_clamped_before_storage() {
        let reply = model_json("critical", 150.0, 1.5);
        let mut engine = engine_with(vec![Ok(reply.as_str())]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        let outcome = engine.record_change(flag.id, toggle_on()).await.unwrap();
        assert_eq!(outcome.prediction.risk_score, 100.0);
        assert_eq!(outcome.prediction.confidence, 1.0);
    }

    #[tokio::test]
    async fn second_prediction_replaces_the_first() {
        let first = model_json("low", 10.0, 0.9);
        let second = model_json("high", 80.0, 0.7);
        let mut engine = engine_with(vec![Ok(first.as_str()), Ok(second.as_str())]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        engine.record_change(flag.id, toggle_on()).await.unwrap();
        engine.record_change(flag.id, toggle_on()).await.unwrap();

        let predictions = ImpactPrediction::list(engine.pool(), 10).await.unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].risk_level, RiskLevel::High);
        assert_eq!(predictions[0].risk_score, 80.0);
    }

    #[tokio::test]
    async fn known_state_snapshot_is_applied_to_the_flag() {
        let reply = model_json("low", 10.0, 0.9);
        let mut engine = engine_with(vec![Ok(reply.as_str())]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();
        assert!(!flag.enabled);

        engine.record_change(flag.id, toggle_on()).await.unwrap();
        let flag = FeatureFlag::find_by_id(engine.pool(), flag.id)
            .await
            .unwrap()
            .unwrap();
        assert!(flag.enabled);
    }

    #[tokio::test]
    async fn analyze_unknown_flag_is_not_found() {
        let mut engine = engine_with(vec![]).await;
        let err = engine.analyze_flag(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn analyze_returns_refreshed_flag_and_prediction() {
        let reply = model_json("medium", 40.0, 0.6);
        let mut engine = engine_with(vec![Ok(reply.as_str())]).await;
        let created = engine.create_flag(create_request("f")).await.unwrap();

        let (flag, outcome) = engine.analyze_flag(created.id).await.unwrap();
        assert_eq!(flag.id, created.id);
        assert_eq!(outcome.change.change_type, ChangeType::Enabled);
        assert_eq!(outcome.prediction.risk_level, RiskLevel::Medium);
        // Synthetic change snapshots the current stored state on both sides
        assert!(outcome.change.previous_value.is_some());
    }

    #[tokio::test]
    async fn error_spike_emerges_on_sixth_sample() {
        let mut engine = engine_with(vec![]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        // Insertion order [1,1,1,1,1,5]: recent mean 1.8 vs baseline 1.0
        for (i, rate) in [1.0, 1.0, 1.0, 1.0, 1.0].into_iter().enumerate() {
            let (_, anomalies) = engine
                .ingest_metrics(metrics(flag.id, rate, i as i64))
                .await
                .unwrap();
            assert!(anomalies.is_empty(), "no anomaly before a baseline exists");
        }
        let (_, anomalies) = engine.ingest_metrics(metrics(flag.id, 5.0, 5)).await.unwrap();

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].anomaly_type, AnomalyType::ErrorSpike);
        assert_eq!(anomalies[0].severity, Severity::Warning);
        // Evidence is the single most-recent sample, not an aggregate
        assert_eq!(anomalies[0].metrics.0.error_rate, 5.0);
    }

    #[tokio::test]
    async fn repeated_scan_of_unchanged_window_re_emits() {
        let mut engine = engine_with(vec![]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();
        for (i, rate) in [1.0, 1.0, 1.0, 1.0, 1.0, 5.0].into_iter().enumerate() {
            engine
                .ingest_metrics(metrics(flag.id, rate, i as i64))
                .await
                .unwrap();
        }

        let again = detector::detect(engine.pool(), &flag).await.unwrap();
        assert_eq!(again.len(), 1);

        let all = Anomaly::list(engine.pool(), AnomalyFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn chat_failure_returns_apology_and_logs_it_as_a_reply() {
        let mut engine = engine_with(vec![Err("timeout")]).await;
        let session_id = Uuid::new_v4();

        let reply = engine.chat(session_id, "how risky is checkout-v2?").await.unwrap();
        assert!(reply.starts_with("I'm sorry"));

        let log = ConversationMessage::recent(engine.pool(), session_id, 10)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].role, Role::User);
        assert_eq!(log[1].role, Role::Assistant);
        assert_eq!(log[1].content, reply);
    }

    #[tokio::test]
    async fn chat_reply_is_appended_to_the_session() {
        let mut engine = engine_with(vec![Ok("All flags look healthy.")]).await;
        let session_id = Uuid::new_v4();

        let reply = engine.chat(session_id, "status?").await.unwrap();
        assert_eq!(reply, "All flags look healthy.");

        let log = ConversationMessage::recent(engine.pool(), session_id, 10)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn pipeline_broadcasts_change_and_anomalies_to_sessions() {
        let reply = model_json("low", 10.0, 0.9);
        let mut engine = engine_with(vec![Ok(reply.as_str())]).await;
        let flag = engine.create_flag(create_request("f")).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.register_session(tx);

        engine.record_change(flag.id, toggle_on()).await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::FlagChanged { .. }));
    }
}
