use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::schema::tickets;
use crate::shared::state::AppState;
use crate::tickets::{CATEGORIES, STATUSES};

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_tickets: i64,
    pub tickets_by_status: BTreeMap<String, i64>,
    pub tickets_by_category: BTreeMap<String, i64>,
    pub classification_stats: ClassificationStats,
    pub recent_activity: Vec<RecentTicket>,
}

#[derive(Debug, Serialize)]
pub struct ClassificationStats {
    pub total_tickets: i64,
    pub ai_classified: i64,
    pub manually_classified: i64,
    pub unclassified: i64,
    pub average_confidence: Option<f64>,
    pub classification_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct RecentTicket {
    pub id: Uuid,
    pub subject: String,
    pub status: String,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Dashboard statistics over the ticket table.
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let total_tickets: i64 = tickets::table
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);

    // Every status shows up in the response even when its count is zero.
    let mut tickets_by_status = BTreeMap::new();
    for status in STATUSES {
        let count: i64 = tickets::table
            .filter(tickets::status.eq(status))
            .count()
            .get_result(&mut conn)
            .unwrap_or(0);
        tickets_by_status.insert(status.to_string(), count);
    }

    let mut tickets_by_category = BTreeMap::new();
    for category in CATEGORIES {
        let count: i64 = tickets::table
            .filter(tickets::category.eq(category))
            .count()
            .get_result(&mut conn)
            .unwrap_or(0);
        if count > 0 {
            tickets_by_category.insert(category.to_string(), count);
        }
    }
    let uncategorized: i64 = tickets::table
        .filter(tickets::category.is_null())
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);
    if uncategorized > 0 {
        tickets_by_category.insert("uncategorized".to_string(), uncategorized);
    }

    let ai_classified: i64 = tickets::table
        .filter(tickets::confidence.is_not_null())
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);

    let manually_classified: i64 = tickets::table
        .filter(tickets::category.is_not_null())
        .filter(tickets::confidence.is_null())
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);

    let unclassified: i64 = tickets::table
        .filter(tickets::category.is_null())
        .count()
        .get_result(&mut conn)
        .unwrap_or(0);

    let average_confidence: Option<f64> = tickets::table
        .filter(tickets::confidence.is_not_null())
        .select(diesel::dsl::avg(tickets::confidence))
        .first::<Option<f64>>(&mut conn)
        .unwrap_or(None)
        .map(|avg| (avg * 100.0).round() / 100.0);

    let classification_rate = if total_tickets > 0 {
        let classified = (ai_classified + manually_classified) as f64;
        (classified / total_tickets as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    let recent_activity: Vec<RecentTicket> = tickets::table
        .select((
            tickets::id,
            tickets::subject,
            tickets::status,
            tickets::category,
            tickets::created_at,
        ))
        .order(tickets::created_at.desc())
        .limit(5)
        .load::<(Uuid, String, String, Option<String>, DateTime<Utc>)>(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?
        .into_iter()
        .map(|(id, subject, status, category, created_at)| RecentTicket {
            id,
            subject,
            status,
            category,
            created_at,
        })
        .collect();

    Ok(Json(StatsResponse {
        total_tickets,
        tickets_by_status,
        tickets_by_category,
        classification_stats: ClassificationStats {
            total_tickets,
            ai_classified,
            manually_classified,
            unclassified,
            average_confidence,
            classification_rate,
        },
        recent_activity,
    }))
}
