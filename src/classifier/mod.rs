use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use crate::llm::rate_limiter::FixedWindowLimiter;
use crate::llm::LlmProvider;
use crate::tickets::{Ticket, CATEGORIES};

const SYSTEM_PROMPT: &str = "You are an AI assistant that classifies support tickets. \
Analyze the ticket subject and body, then respond with a JSON object containing exactly \
three keys: \"category\" (one of: technical, billing, general, bug_report, \
feature_request, account, other), \"explanation\" (a brief explanation of why this \
category was chosen), and \"confidence\" (a float between 0 and 1 indicating your \
confidence in this classification).";

const DUMMY_EXPLANATION: &str =
    "This is a dummy classification generated when the AI provider is disabled or unavailable.";

const MAX_TOKENS: u32 = 200;
const TEMPERATURE: f64 = 0.3;

/// The triple a classification produces. Consumed by the job immediately,
/// never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: String,
    pub explanation: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Rate limit exceeded. Please try again later.")]
    RateLimitExceeded,
    #[error("rate limit store unavailable: {0}")]
    Counter(#[source] anyhow::Error),
}

/// Check a parsed provider payload against the classification contract:
/// the three keys must be present (extra keys are ignored), the category
/// must be in the fixed set and the confidence numeric in [0, 1]. The
/// explanation content is not constrained.
pub fn is_valid_classification(value: &Value) -> bool {
    let Some(map) = value.as_object() else {
        return false;
    };

    if !map.contains_key("category")
        || !map.contains_key("explanation")
        || !map.contains_key("confidence")
    {
        return false;
    }

    let Some(category) = map["category"].as_str() else {
        return false;
    };
    if !CATEGORIES.contains(&category) {
        return false;
    }

    match map["confidence"].as_f64() {
        Some(confidence) => (0.0..=1.0).contains(&confidence),
        None => false,
    }
}

/// Placeholder result used whenever the real provider cannot be consulted:
/// a uniformly random category with a canned explanation and a plausible
/// confidence in [0.50, 0.95].
pub fn dummy_classification() -> ClassificationResult {
    let mut rng = rand::thread_rng();
    let category = CATEGORIES[rng.gen_range(0..CATEGORIES.len())].to_string();
    let confidence = f64::from(rng.gen_range(50..=95u32)) / 100.0;

    ClassificationResult {
        category,
        explanation: DUMMY_EXPLANATION.to_string(),
        confidence,
    }
}

pub struct TicketClassifier {
    provider: Arc<dyn LlmProvider>,
    limiter: FixedWindowLimiter,
    enabled: bool,
}

impl TicketClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>, limiter: FixedWindowLimiter, enabled: bool) -> Self {
        Self {
            provider,
            limiter,
            enabled,
        }
    }

    /// Classify a ticket. Rate-limit exhaustion is the only hard failure;
    /// every provider-side problem degrades to a dummy classification so the
    /// pipeline is never blocked on vendor availability.
    pub async fn classify(&self, ticket: &Ticket) -> Result<ClassificationResult, ClassifierError> {
        if !self
            .limiter
            .check()
            .await
            .map_err(ClassifierError::Counter)?
        {
            warn!("Classification rate limit exceeded for ticket {}", ticket.id);
            return Err(ClassifierError::RateLimitExceeded);
        }

        if !self.enabled {
            return Ok(dummy_classification());
        }

        if !self
            .limiter
            .try_acquire()
            .await
            .map_err(ClassifierError::Counter)?
        {
            warn!("Classification rate limit exceeded for ticket {}", ticket.id);
            return Err(ClassifierError::RateLimitExceeded);
        }

        let user_message = format!("Subject: {}\n\nBody: {}", ticket.subject, ticket.body);

        let content = match self
            .provider
            .complete(SYSTEM_PROMPT, &user_message, MAX_TOKENS, TEMPERATURE)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                error!("Classification provider call failed for {}: {e}", ticket.id);
                return Ok(dummy_classification());
            }
        };

        let parsed: Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(_) => {
                warn!(
                    reason = "unparseable",
                    "Invalid classification response for {}: {content}", ticket.id
                );
                return Ok(dummy_classification());
            }
        };

        if !is_valid_classification(&parsed) {
            // A well-formed but invalid payload usually means the model broke
            // the output contract; keep it distinguishable from parse noise.
            warn!(
                reason = "contract",
                "Invalid classification response for {}: {content}", ticket.id
            );
            return Ok(dummy_classification());
        }

        let result = ClassificationResult {
            category: parsed["category"].as_str().unwrap_or_default().to_string(),
            explanation: parsed["explanation"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            confidence: parsed["confidence"].as_f64().unwrap_or_default(),
        };

        Ok(result)
    }
}
