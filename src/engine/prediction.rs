//! Prediction engine
//!
//! Assembles a structured context (change + historical metrics + recent
//! change history) into a prompt, invokes the language model, and parses its
//! structured response. Every path produces a value: malformed output and
//! transport failures each substitute a distinct fallback, never an error.

use serde::Deserialize;

use crate::engine::llm::{ChatMessage, CompletionOptions, LlmClient};
use crate::models::{FlagChange, ImpactDeltas, ImpactMetrics, RiskLevel};

pub const PREDICTION_TEMPERATURE: f32 = 0.2;
pub const PREDICTION_MAX_TOKENS: u32 = 1024;

/// How many prior changes the prompt lists
const PROMPT_CHANGE_COUNT: usize = 5;

const SYSTEM_PROMPT: &str = "You are a deployment risk analyst for a feature flag system. \
Given a flag configuration change and historical performance data, assess the risk of the change. \
Respond with ONLY a JSON object of this exact shape: \
{\"riskLevel\": \"low\"|\"medium\"|\"high\"|\"critical\", \
\"riskScore\": <number 0-100>, \
\"predictedImpact\": {\"errorRateChange\": <number>, \"latencyChange\": <number>, \"affectedUserPercentage\": <number>}, \
\"recommendations\": [<strings>], \
\"reasoning\": <string>, \
\"confidence\": <number 0-1>}";

/// Parsed model output, also the shape of both fallbacks
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictionOutcome {
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub predicted_impact: ImpactDeltas,
    pub recommendations: Vec<String>,
    pub reasoning: String,
    pub confidence: f64,
}

impl PredictionOutcome {
    /// Substituted when the model replied but its output could not be parsed
    pub fn parse_fallback() -> Self {
        Self {
            risk_level: RiskLevel::Medium,
            risk_score: 50.0,
            predicted_impact: ImpactDeltas::ZERO,
            recommendations: vec!["Monitor closely after deployment".to_string()],
            reasoning: "Automated analysis was incomplete; conservative defaults applied"
                .to_string(),
            confidence: 0.5,
        }
    }

    /// Substituted when the model call itself failed; lower confidence
    /// signals degraded trust versus a parse failure.
    pub fn failure_fallback() -> Self {
        Self {
            risk_level: RiskLevel::Medium,
            risk_score: 50.0,
            predicted_impact: ImpactDeltas::ZERO,
            recommendations: vec!["Manual review recommended due to analysis error".to_string()],
            reasoning: "Automated analysis unavailable".to_string(),
            confidence: 0.3,
        }
    }

    /// Clamp model-supplied numerics into their documented ranges
    fn clamped(mut self) -> Self {
        self.risk_score = self.risk_score.clamp(0.0, 100.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// Mean error rate, mean p50 latency and total request count over the
/// supplied history. Zero means for an empty set.
pub fn history_summary(history: &[ImpactMetrics]) -> (f64, f64, i64) {
    if history.is_empty() {
        return (0.0, 0.0, 0);
    }
    let n = history.len() as f64;
    let mean_error = history.iter().map(|m| m.error_rate).sum::<f64>() / n;
    let mean_p50 = history.iter().map(|m| m.latency_p50).sum::<f64>() / n;
    let total_requests = history.iter().map(|m| m.request_count).sum();
    (mean_error, mean_p50, total_requests)
}

/// Render the change context as a natural-language description
pub fn build_user_prompt(
    change: &FlagChange,
    history: &[ImpactMetrics],
    recent_changes: &[FlagChange],
) -> String {
    let (mean_error, mean_p50, total_requests) = history_summary(history);

    let previous = change
        .previous_value
        .as_ref()
        .map(|v| v.0.to_string())
        .unwrap_or_else(|| "null".to_string());

    let mut prompt = format!(
        "A feature flag change was recorded:\n\
         - Flag: {}\n\
         - Change type: {}\n\
         - Environment: {:?}\n\
         - Actor: {}\n\
         - Previous value: {}\n\
         - New value: {}\n\n\
         Historical performance ({} samples):\n\
         - Mean error rate: {:.2}%\n\
         - Mean p50 latency: {:.1}ms\n\
         - Total requests: {}\n",
        change.flag_name,
        change.change_type.as_str(),
        change.environment,
        change.actor,
        previous,
        change.new_value.0,
        history.len(),
        mean_error,
        mean_p50,
        total_requests,
    );

    if recent_changes.is_empty() {
        prompt.push_str("\nNo prior changes recorded for this flag.\n");
    } else {
        prompt.push_str("\nMost recent prior changes:\n");
        for prior in recent_changes.iter().take(PROMPT_CHANGE_COUNT) {
            prompt.push_str(&format!(
                "- {} at {}\n",
                prior.change_type.as_str(),
                prior.created_at.to_rfc3339()
            ));
        }
    }

    prompt.push_str("\nAssess the risk of this change.");
    prompt
}

/// Extract the first brace-delimited substring; the model may wrap the JSON
/// object in prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

pub fn parse_model_output(text: &str) -> Option<PredictionOutcome> {
    let json = extract_json(text)?;
    serde_json::from_str(json).ok()
}

/// Produce a prediction for the change. Never fails: malformed output and
/// transport errors each substitute their fallback.
pub async fn predict(
    llm: &dyn LlmClient,
    change: &FlagChange,
    history: &[ImpactMetrics],
    recent_changes: &[FlagChange],
) -> PredictionOutcome {
    let messages = [
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(build_user_prompt(change, history, recent_changes)),
    ];
    let options = CompletionOptions {
        temperature: PREDICTION_TEMPERATURE,
        max_tokens: PREDICTION_MAX_TOKENS,
    };

    match llm.complete(&messages, options).await {
        Ok(text) => match parse_model_output(&text) {
            Some(outcome) => outcome.clamped(),
            None => {
                tracing::warn!(
                    flag = %change.flag_name,
                    "Model response contained no parseable prediction, using defaults"
                );
                PredictionOutcome::parse_fallback()
            }
        },
        Err(e) => {
            tracing::warn!(flag = %change.flag_name, "Prediction call failed: {}", e);
            PredictionOutcome::failure_fallback()
        }
    }
}
