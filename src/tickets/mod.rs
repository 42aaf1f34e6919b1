pub mod export;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::classifier::ClassificationResult;
use crate::jobs::{self, ClassifyJob};
use crate::schema::tickets;
use crate::shared::state::AppState;

pub const STATUSES: [&str; 3] = ["open", "closed", "pending"];

pub const CATEGORIES: [&str; 7] = [
    "technical",
    "billing",
    "general",
    "bug_report",
    "feature_request",
    "account",
    "other",
];

pub const MAX_SUBJECT_LEN: usize = 255;
pub const MAX_BODY_LEN: usize = 10_000;
pub const MAX_NOTE_LEN: usize = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = tickets)]
pub struct Ticket {
    pub id: Uuid,
    pub subject: String,
    pub body: String,
    pub status: String,
    pub category: Option<String>,
    pub explanation: Option<String>,
    pub confidence: Option<f64>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tri-state classification of a ticket, derived from the nullable column
/// layout. Confidence present means the category was written by the
/// classifier; category without confidence means a human set it.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Unclassified,
    Manual {
        category: String,
    },
    Ai {
        category: String,
        explanation: Option<String>,
        confidence: f64,
    },
}

impl Ticket {
    pub fn classification(&self) -> Classification {
        match (&self.category, self.confidence) {
            (Some(category), Some(confidence)) => Classification::Ai {
                category: category.clone(),
                explanation: self.explanation.clone(),
                confidence,
            },
            (Some(category), None) => Classification::Manual {
                category: category.clone(),
            },
            (None, _) => Classification::Unclassified,
        }
    }

    pub fn is_manually_categorized(&self) -> bool {
        matches!(self.classification(), Classification::Manual { .. })
    }

    pub fn has_ai_classification(&self) -> bool {
        matches!(self.classification(), Classification::Ai { .. })
    }
}

/// The field set a classification job writes back, decided by the
/// preserve-manual policy. Kept separate from the persistence call so the
/// policy is a pure function of the current state.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationUpdate {
    /// Attach the AI rationale and confidence while leaving a human-chosen
    /// category untouched.
    PreserveCategory { explanation: String, confidence: f64 },
    /// Write all three classification fields.
    Replace {
        category: String,
        explanation: String,
        confidence: f64,
    },
}

pub fn apply_classification(
    current: &Classification,
    result: &ClassificationResult,
    preserve_manual_category: bool,
) -> ClassificationUpdate {
    if preserve_manual_category && matches!(current, Classification::Manual { .. }) {
        ClassificationUpdate::PreserveCategory {
            explanation: result.explanation.clone(),
            confidence: result.confidence,
        }
    } else {
        ClassificationUpdate::Replace {
            category: result.category.clone(),
            explanation: result.explanation.clone(),
            confidence: result.confidence,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    pub body: String,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTicketRequest {
    pub status: Option<String>,
    // Double Option: absent means leave untouched, explicit null clears.
    #[serde(default)]
    pub category: Option<Option<String>>,
    #[serde(default)]
    pub note: Option<Option<String>>,
}

#[derive(AsChangeset)]
#[diesel(table_name = tickets)]
struct TicketChanges {
    status: Option<String>,
    category: Option<Option<String>>,
    note: Option<Option<String>>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub search: Option<String>,
    pub status: Option<String>,
    pub category: Option<String>,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TicketPage {
    pub data: Vec<Ticket>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

#[derive(Debug, Serialize)]
pub struct ClassifyDispatched {
    pub message: String,
    pub ticket_id: Uuid,
}

/// Compose the list/export filter predicates into one boxed query.
/// Unknown status/category values are ignored rather than rejected.
pub(crate) fn filtered_query(
    status: Option<&str>,
    category: Option<&str>,
    search: Option<&str>,
) -> tickets::BoxedQuery<'static, Pg> {
    let mut q = tickets::table.into_boxed();

    if let Some(status) = status {
        if STATUSES.contains(&status) {
            q = q.filter(tickets::status.eq(status.to_string()));
        }
    }

    if let Some(category) = category {
        if CATEGORIES.contains(&category) {
            q = q.filter(tickets::category.eq(category.to_string()));
        }
    }

    if let Some(search) = search {
        if !search.is_empty() {
            let pattern = format!("%{search}%");
            q = q.filter(
                tickets::subject
                    .ilike(pattern.clone())
                    .or(tickets::body.ilike(pattern)),
            );
        }
    }

    q
}

fn validate_create(req: &CreateTicketRequest) -> Result<(), String> {
    if req.subject.trim().is_empty() {
        return Err("The ticket subject is required.".to_string());
    }
    if req.subject.chars().count() > MAX_SUBJECT_LEN {
        return Err(format!(
            "The ticket subject cannot exceed {MAX_SUBJECT_LEN} characters."
        ));
    }
    if req.body.trim().is_empty() {
        return Err("The ticket body is required.".to_string());
    }
    if req.body.chars().count() > MAX_BODY_LEN {
        return Err(format!(
            "The ticket body cannot exceed {MAX_BODY_LEN} characters."
        ));
    }
    if let Some(status) = &req.status {
        if !STATUSES.contains(&status.as_str()) {
            return Err(format!(
                "The status must be one of: {}",
                STATUSES.join(", ")
            ));
        }
    }
    Ok(())
}

fn validate_update(req: &UpdateTicketRequest) -> Result<(), String> {
    if let Some(status) = &req.status {
        if !STATUSES.contains(&status.as_str()) {
            return Err(format!(
                "The status must be one of: {}",
                STATUSES.join(", ")
            ));
        }
    }
    if let Some(Some(category)) = &req.category {
        if !CATEGORIES.contains(&category.as_str()) {
            return Err(format!(
                "The category must be one of: {}",
                CATEGORIES.join(", ")
            ));
        }
    }
    if let Some(Some(note)) = &req.note {
        if note.chars().count() > MAX_NOTE_LEN {
            return Err(format!(
                "The note cannot exceed {MAX_NOTE_LEN} characters."
            ));
        }
    }
    Ok(())
}

pub async fn create_ticket(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTicketRequest>,
) -> Result<(StatusCode, Json<Ticket>), (StatusCode, String)> {
    validate_create(&req).map_err(|msg| (StatusCode::UNPROCESSABLE_ENTITY, msg))?;

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let now = Utc::now();
    let ticket = Ticket {
        id: Uuid::now_v7(),
        subject: req.subject,
        body: req.body,
        status: req.status.unwrap_or_else(|| "open".to_string()),
        category: None,
        explanation: None,
        confidence: None,
        note: None,
        created_at: now,
        updated_at: now,
    };

    diesel::insert_into(tickets::table)
        .values(&ticket)
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Insert error: {e}")))?;

    info!("New ticket created: {}", ticket.id);

    Ok((StatusCode::CREATED, Json(ticket)))
}

pub async fn list_tickets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TicketPage>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let per_page = query.per_page.unwrap_or(15).clamp(1, 50);
    let page = query.page.unwrap_or(1).max(1);

    let total: i64 = filtered_query(
        query.status.as_deref(),
        query.category.as_deref(),
        query.search.as_deref(),
    )
    .count()
    .get_result(&mut conn)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    let data: Vec<Ticket> = filtered_query(
        query.status.as_deref(),
        query.category.as_deref(),
        query.search.as_deref(),
    )
    .order(tickets::created_at.desc())
    .limit(per_page)
    .offset((page - 1) * per_page)
    .load(&mut conn)
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    Ok(Json(TicketPage {
        data,
        total,
        page,
        per_page,
    }))
}

pub async fn get_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ticket>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let ticket: Ticket = tickets::table
        .filter(tickets::id.eq(id))
        .first(&mut conn)
        .map_err(|_| (StatusCode::NOT_FOUND, "Ticket not found".to_string()))?;

    Ok(Json(ticket))
}

pub async fn update_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, (StatusCode, String)> {
    validate_update(&req).map_err(|msg| (StatusCode::UNPROCESSABLE_ENTITY, msg))?;

    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let existing: Ticket = tickets::table
        .filter(tickets::id.eq(id))
        .first(&mut conn)
        .map_err(|_| (StatusCode::NOT_FOUND, "Ticket not found".to_string()))?;

    let changes = TicketChanges {
        status: req.status,
        category: req.category.clone(),
        note: req.note,
        updated_at: Utc::now(),
    };

    // One UPDATE so concurrent classification jobs never observe a
    // partially applied edit.
    diesel::update(tickets::table.filter(tickets::id.eq(id)))
        .set(&changes)
        .execute(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Update error: {e}")))?;

    let updated: Ticket = tickets::table
        .filter(tickets::id.eq(id))
        .first(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

    if existing.category != updated.category {
        info!(
            "Ticket category updated: {} ({:?} -> {:?})",
            id, existing.category, updated.category
        );
    }

    Ok(Json(updated))
}

/// Dispatch an AI classification job for the ticket. Returns as soon as the
/// job is on the queue.
pub async fn classify_ticket(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClassifyDispatched>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let _ticket: Ticket = tickets::table
        .filter(tickets::id.eq(id))
        .first(&mut conn)
        .map_err(|_| (StatusCode::NOT_FOUND, "Ticket not found".to_string()))?;

    let job = ClassifyJob::new(id, true);
    match jobs::enqueue(&state.cache, &job).await {
        Ok(()) => {
            info!("Classification job dispatched: {id}");
            Ok(Json(ClassifyDispatched {
                message: "Classification job queued successfully".to_string(),
                ticket_id: id,
            }))
        }
        Err(e) => {
            error!("Failed to dispatch classification job for {id}: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to queue classification job: {e}"),
            ))
        }
    }
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", get(list_tickets).post(create_ticket))
        .route("/api/tickets/:id", get(get_ticket).put(update_ticket))
        .route("/api/tickets/:id/classify", post(classify_ticket))
        .route("/api/tickets-export", get(export::export_tickets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket_with(category: Option<&str>, confidence: Option<f64>) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::now_v7(),
            subject: "Cannot log in".to_string(),
            body: "Password reset emails never arrive".to_string(),
            status: "open".to_string(),
            category: category.map(str::to_string),
            explanation: None,
            confidence,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn unclassified_ticket_has_neither_predicate() {
        let ticket = ticket_with(None, None);
        assert_eq!(ticket.classification(), Classification::Unclassified);
        assert!(!ticket.is_manually_categorized());
        assert!(!ticket.has_ai_classification());
    }

    #[test]
    fn category_without_confidence_is_manual() {
        let ticket = ticket_with(Some("billing"), None);
        assert!(ticket.is_manually_categorized());
        assert!(!ticket.has_ai_classification());
    }

    #[test]
    fn category_with_confidence_is_ai_classified() {
        let ticket = ticket_with(Some("technical"), Some(0.9));
        assert!(!ticket.is_manually_categorized());
        assert!(ticket.has_ai_classification());
    }

    #[test]
    fn preserve_manual_keeps_human_category() {
        let ticket = ticket_with(Some("billing"), None);
        let result = ClassificationResult {
            category: "technical".to_string(),
            explanation: "x".to_string(),
            confidence: 0.9,
        };

        let update = apply_classification(&ticket.classification(), &result, true);
        assert_eq!(
            update,
            ClassificationUpdate::PreserveCategory {
                explanation: "x".to_string(),
                confidence: 0.9,
            }
        );
    }

    #[test]
    fn unclassified_ticket_takes_all_result_fields() {
        let ticket = ticket_with(None, None);
        let result = ClassificationResult {
            category: "bug_report".to_string(),
            explanation: "y".to_string(),
            confidence: 0.7,
        };

        for preserve in [true, false] {
            let update = apply_classification(&ticket.classification(), &result, preserve);
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

    #[test]
    fn preserve_disabled_replaces_manual_category() {
        let ticket = ticket_with(Some("billing"), None);
        let result = ClassificationResult {
            category: "account".to_string(),
            explanation: "moved".to_string(),
            confidence: 0.8,
        };

        let update = apply_classification(&ticket.classification(), &result, false);
        assert!(matches!(
            update,
            ClassificationUpdate::Replace { ref category, .. } if category == "account"
        ));
    }

    #[test]
    fn ai_classified_ticket_is_reclassified_even_when_preserving() {
        let ticket = ticket_with(Some("general"), Some(0.6));
        let result = ClassificationResult {
            category: "technical".to_string(),
            explanation: "z".to_string(),
            confidence: 0.95,
        };

        let update = apply_classification(&ticket.classification(), &result, true);
        assert!(matches!(update, ClassificationUpdate::Replace { .. }));
    }

    #[test]
    fn create_validation_enforces_lengths_and_status() {
        let ok = CreateTicketRequest {
            subject: "s".repeat(255),
            body: "b".to_string(),
            status: Some("pending".to_string()),
        };
        assert!(validate_create(&ok).is_ok());

        let long_subject = CreateTicketRequest {
            subject: "s".repeat(256),
            body: "b".to_string(),
            status: None,
        };
        assert!(validate_create(&long_subject).is_err());

        let bad_status = CreateTicketRequest {
            subject: "s".to_string(),
            body: "b".to_string(),
            status: Some("archived".to_string()),
        };
        assert!(validate_create(&bad_status).is_err());
    }

    #[test]
    fn update_validation_rejects_unknown_category() {
        let req = UpdateTicketRequest {
            status: None,
            category: Some(Some("spam".to_string())),
            note: None,
        };
        assert!(validate_update(&req).is_err());

        let clearing = UpdateTicketRequest {
            status: None,
            category: Some(None),
            note: None,
        };
        assert!(validate_update(&clearing).is_ok());
    }
}
