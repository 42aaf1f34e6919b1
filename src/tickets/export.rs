use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
};

use chrono::Utc;
use diesel::prelude::*;
use std::sync::Arc;

use super::{filtered_query, ListQuery, Ticket};
use crate::schema::tickets;
use crate::shared::state::AppState;

const EXPORT_CHUNK_SIZE: i64 = 100;

/// Export tickets as CSV, honoring the same filters as the list endpoint.
pub async fn export_tickets(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut conn = state
        .conn
        .get()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("DB error: {e}")))?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record([
            "ID",
            "Subject",
            "Body",
            "Status",
            "Category",
            "Confidence",
            "Note",
            "Created At",
            "Updated At",
        ])
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("CSV error: {e}")))?;

    // Page through the result set rather than loading everything at once.
    let mut offset = 0;
    loop {
        let batch: Vec<Ticket> = filtered_query(
            query.status.as_deref(),
            query.category.as_deref(),
            query.search.as_deref(),
        )
        .order(tickets::created_at.desc())
        .limit(EXPORT_CHUNK_SIZE)
        .offset(offset)
        .load(&mut conn)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Query error: {e}")))?;

        let batch_len = batch.len() as i64;
        for ticket in batch {
            writer
                .write_record([
                    ticket.id.to_string(),
                    ticket.subject,
                    ticket.body,
                    ticket.status,
                    ticket.category.unwrap_or_default(),
                    ticket
                        .confidence
                        .map(|c| c.to_string())
                        .unwrap_or_default(),
                    ticket.note.unwrap_or_default(),
                    ticket.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    ticket.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                ])
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("CSV error: {e}")))?;
        }

        if batch_len < EXPORT_CHUNK_SIZE {
            break;
        }
        offset += EXPORT_CHUNK_SIZE;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("CSV error: {e}")))?;

    let filename = format!(
        "tickets_export_{}.csv",
        Utc::now().format("%Y-%m-%d_%H-%M-%S")
    );

    Ok((
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}
