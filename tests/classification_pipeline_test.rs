//! End-to-end coverage of the classification pipeline: classifier against a
//! scripted provider, the fixed-window quota, and the preserve-manual policy.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use ticketserver::classifier::{ClassifierError, TicketClassifier};
use ticketserver::llm::rate_limiter::{FixedWindowLimiter, InMemoryCounterStore, WINDOW};
use ticketserver::llm::{LlmProvider, ProviderError};
use ticketserver::tickets::{
    apply_classification, Classification, ClassificationUpdate, Ticket, CATEGORIES,
};

struct ScriptedProvider {
    response: Option<String>,
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        _system: &str,
        _user: &str,
        _max_tokens: u32,
        _temperature: f64,
    ) -> Result<String, ProviderError> {
        match &self.response {
            Some(text) => Ok(text.clone()),
            None => Err(ProviderError::MalformedResponse),
        }
    }
}

fn ticket(category: Option<&str>, confidence: Option<f64>) -> Ticket {
    let now = Utc::now();
    Ticket {
        id: Uuid::now_v7(),
        subject: "Printer on fire".to_string(),
        body: "Smoke is coming out of the tray".to_string(),
        status: "open".to_string(),
        category: category.map(str::to_string),
        explanation: None,
        confidence,
        note: None,
        created_at: now,
        updated_at: now,
    }
}

fn classifier(response: Option<&str>, ceiling: u32, enabled: bool) -> TicketClassifier {
    TicketClassifier::new(
        Arc::new(ScriptedProvider {
            response: response.map(str::to_string),
        }),
        FixedWindowLimiter::new(Arc::new(InMemoryCounterStore::new()), ceiling, WINDOW),
        enabled,
    )
}

#[tokio::test]
async fn manual_category_survives_a_preserving_classification() {
    let classifier = classifier(
        Some(r#"{"category":"technical","explanation":"x","confidence":0.9}"#),
        10,
        true,
    );

    let manual_ticket = ticket(Some("billing"), None);
    assert!(manual_ticket.is_manually_categorized());

    let result = classifier.classify(&manual_ticket).await.unwrap();
    let update = apply_classification(&manual_ticket.classification(), &result, true);

    // Final state: billing stays, rationale and confidence come from the AI.
    assert_eq!(
        update,
        ClassificationUpdate::PreserveCategory {
            explanation: "x".to_string(),
            confidence: 0.9,
        }
    );
}

#[tokio::test]
async fn unclassified_ticket_takes_the_full_result() {
    let classifier = classifier(
        Some(r#"{"category":"bug_report","explanation":"y","confidence":0.7}"#),
        10,
        true,
    );

    let fresh = ticket(None, None);
    assert_eq!(fresh.classification(), Classification::Unclassified);

    let result = classifier.classify(&fresh).await.unwrap();

    for preserve in [true, false] {
        let update = apply_classification(&fresh.classification(), &result, preserve);
        assert_eq!(
            update,
            ClassificationUpdate::Replace {
                category: "bug_report".to_string(),
                explanation: "y".to_string(),
                confidence: 0.7,
            }
        );
    }
}

#[tokio::test]
async fn eleventh_call_in_a_window_is_a_hard_rate_limit_failure() {
    let classifier = classifier(
        Some(r#"{"category":"general","explanation":"ok","confidence":0.8}"#),
        10,
        true,
    );
    let subject = ticket(None, None);

    for _ in 0..10 {
        classifier.classify(&subject).await.unwrap();
    }

    let err = classifier.classify(&subject).await.unwrap_err();
    assert!(matches!(err, ClassifierError::RateLimitExceeded));
}

#[tokio::test]
async fn rate_limit_clears_once_the_window_expires() {
    let classifier = TicketClassifier::new(
        Arc::new(ScriptedProvider {
            response: Some(
                r#"{"category":"account","explanation":"ok","confidence":0.8}"#.to_string(),
            ),
        }),
        FixedWindowLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            1,
            Duration::from_millis(50),
        ),
        true,
    );
    let subject = ticket(None, None);

    classifier.classify(&subject).await.unwrap();
    assert!(matches!(
        classifier.classify(&subject).await,
        Err(ClassifierError::RateLimitExceeded)
    ));

    tokio::time::sleep(Duration::from_millis(80)).await;
    classifier.classify(&subject).await.unwrap();
}

#[tokio::test]
async fn garbage_provider_output_degrades_instead_of_failing() {
    let classifier = classifier(Some("not json"), 10, true);
    let result = classifier.classify(&ticket(None, None)).await.unwrap();

    assert!(CATEGORIES.contains(&result.category.as_str()));
    assert!((0.50..=0.95).contains(&result.confidence));
}

#[tokio::test]
async fn provider_outage_degrades_instead_of_failing() {
    let classifier = classifier(None, 10, true);
    let result = classifier.classify(&ticket(Some("billing"), None)).await.unwrap();

    assert!(CATEGORIES.contains(&result.category.as_str()));
    assert!((0.50..=0.95).contains(&result.confidence));
}

#[tokio::test]
async fn disabled_pipeline_always_yields_a_plausible_dummy() {
    let classifier = classifier(None, 10, false);

    for _ in 0..20 {
        let result = classifier.classify(&ticket(None, None)).await.unwrap();
        assert!(CATEGORIES.contains(&result.category.as_str()));
        assert!((0.50..=0.95).contains(&result.confidence));
    }
}
