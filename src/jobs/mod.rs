pub mod bulk;

use anyhow::anyhow;
use chrono::Utc;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classifier::TicketClassifier;
use crate::schema::tickets;
use crate::shared::utils::DbPool;
use crate::tickets::{apply_classification, ClassificationUpdate, Ticket};

pub const QUEUE_KEY: &str = "tickets:classify:queue";

/// Attempts per job, counting the first one.
pub const MAX_ATTEMPTS: u32 = 3;

/// Bound on a single attempt, provider latency included.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

const IDLE_POLL: Duration = Duration::from_secs(1);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyJob {
    pub ticket_id: Uuid,
    pub preserve_manual_category: bool,
    #[serde(default)]
    pub attempt: u32,
}

impl ClassifyJob {
    pub fn new(ticket_id: Uuid, preserve_manual_category: bool) -> Self {
        Self {
            ticket_id,
            preserve_manual_category,
            attempt: 0,
        }
    }
}

/// Job failures are explicitly discriminated so the worker never has to
/// inspect error types to decide on a retry.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Retryable(#[source] anyhow::Error),
    #[error("{0}")]
    Terminal(#[source] anyhow::Error),
}

/// Decide whether a failed attempt goes back on the queue. Returns the next
/// attempt number, or None when the job is spent.
pub fn retry_decision(attempt: u32, err: &JobError) -> Option<u32> {
    match err {
        JobError::Retryable(_) => {
            let next = attempt + 1;
            (next < MAX_ATTEMPTS).then_some(next)
        }
        JobError::Terminal(_) => None,
    }
}

/// Put a classification job on the queue. Non-blocking for the caller; the
/// worker picks it up with at-least-once semantics.
pub async fn enqueue(cache: &redis::Client, job: &ClassifyJob) -> anyhow::Result<()> {
    let mut conn = cache.get_multiplexed_async_connection().await?;
    let payload = serde_json::to_string(job)?;
    let _: () = redis::cmd("LPUSH")
        .arg(QUEUE_KEY)
        .arg(payload)
        .query_async(&mut conn)
        .await?;
    Ok(())
}

pub struct ClassifyWorker {
    db: DbPool,
    cache: Arc<redis::Client>,
    classifier: Arc<TicketClassifier>,
}

impl ClassifyWorker {
    pub fn new(db: DbPool, cache: Arc<redis::Client>, classifier: Arc<TicketClassifier>) -> Self {
        Self {
            db,
            cache,
            classifier,
        }
    }

    pub async fn run_worker_loop(&self) {
        info!("Starting ticket classification worker");
        loop {
            match self.process_next_job().await {
                Ok(true) => continue,
                Ok(false) => {
                    tokio::time::sleep(IDLE_POLL).await;
                }
                Err(e) => {
                    error!("Classification worker error: {e}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }

    async fn process_next_job(&self) -> anyhow::Result<bool> {
        let mut conn = self.cache.get_multiplexed_async_connection().await?;

        let payload: Option<String> = redis::cmd("RPOP")
            .arg(QUEUE_KEY)
            .query_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(false);
        };

        let job: ClassifyJob = serde_json::from_str(&payload)?;
        info!(
            "Starting ticket classification: {} (attempt {}/{})",
            job.ticket_id,
            job.attempt + 1,
            MAX_ATTEMPTS
        );

        let outcome = match tokio::time::timeout(ATTEMPT_TIMEOUT, self.execute(&job)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Retryable(anyhow!(
                "attempt timed out after {}s",
                ATTEMPT_TIMEOUT.as_secs()
            ))),
        };

        match outcome {
            Ok(()) => {}
            Err(err) => match retry_decision(job.attempt, &err) {
                Some(next) => {
                    warn!(
                        "Ticket classification failed for {}, re-queueing: {err}",
                        job.ticket_id
                    );
                    let retry = ClassifyJob {
                        attempt: next,
                        ..job
                    };
                    if let Err(e) = enqueue(&self.cache, &retry).await {
                        // A lost retry ends the job for this ticket; it must
                        // be attributable, not a generic worker error.
                        error!(
                            "Ticket classification job failed permanently for {}: retry could not be queued: {e}",
                            job.ticket_id
                        );
                    }
                }
                None => {
                    // The ticket keeps whatever classification state it last
                    // reached; nothing is rolled back.
                    error!(
                        "Ticket classification job failed permanently for {}: {err}",
                        job.ticket_id
                    );
                }
            },
        }

        Ok(true)
    }

    /// One attempt: load the ticket, classify it, apply the result under the
    /// preserve-manual policy in a single UPDATE. Diesel is synchronous, so
    /// both queries run on the blocking pool; otherwise the attempt timeout
    /// could never preempt a hung database call.
    pub async fn execute(&self, job: &ClassifyJob) -> Result<(), JobError> {
        let pool = self.db.clone();
        let ticket_id = job.ticket_id;

        let ticket: Ticket = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| JobError::Retryable(e.into()))?;
            tickets::table
                .filter(tickets::id.eq(ticket_id))
                .first(&mut conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        JobError::Terminal(anyhow!("ticket {ticket_id} not found"))
                    }
                    other => JobError::Retryable(other.into()),
                })
        })
        .await
        .map_err(|e| JobError::Retryable(e.into()))??;

        let result = self
            .classifier
            .classify(&ticket)
            .await
            .map_err(|e| JobError::Retryable(anyhow::Error::new(e)))?;

        let update =
            apply_classification(&ticket.classification(), &result, job.preserve_manual_category);
        let manual_category = ticket.category.clone();
        let pool = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), JobError> {
            let mut conn = pool.get().map_err(|e| JobError::Retryable(e.into()))?;
            let now = Utc::now();

            match update {
                ClassificationUpdate::PreserveCategory {
                    explanation,
                    confidence,
                } => {
                    diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                        .set((
                            tickets::explanation.eq(Some(explanation)),
                            tickets::confidence.eq(Some(confidence)),
                            tickets::updated_at.eq(now),
                        ))
                        .execute(&mut conn)
                        .map_err(|e| JobError::Retryable(e.into()))?;

                    info!(
                        "Updated ticket {ticket_id} with AI explanation, preserving manual category {manual_category:?}"
                    );
                }
                ClassificationUpdate::Replace {
                    category,
                    explanation,
                    confidence,
                } => {
                    diesel::update(tickets::table.filter(tickets::id.eq(ticket_id)))
                        .set((
                            tickets::category.eq(Some(category.clone())),
                            tickets::explanation.eq(Some(explanation)),
                            tickets::confidence.eq(Some(confidence)),
                            tickets::updated_at.eq(now),
                        ))
                        .execute(&mut conn)
                        .map_err(|e| JobError::Retryable(e.into()))?;

                    info!("Ticket {ticket_id} classified as {category} (confidence {confidence})");
                }
            }

            Ok(())
        })
        .await
        .map_err(|e| JobError::Retryable(e.into()))?
    }
}

pub fn start_classify_worker(
    db: DbPool,
    cache: Arc<redis::Client>,
    classifier: Arc<TicketClassifier>,
) {
    let worker = ClassifyWorker::new(db, cache, classifier);
    tokio::spawn(async move {
        worker.run_worker_loop().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_payload_round_trips_and_defaults_attempt() {
        let job = ClassifyJob::new(Uuid::now_v7(), true);
        let payload = serde_json::to_string(&job).unwrap();
        let parsed: ClassifyJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.ticket_id, job.ticket_id);
        assert!(parsed.preserve_manual_category);
        assert_eq!(parsed.attempt, 0);

        // Older producers may omit the attempt counter entirely.
        let legacy = format!(
            r#"{{"ticket_id":"{}","preserve_manual_category":false}}"#,
            job.ticket_id
        );
        let parsed: ClassifyJob = serde_json::from_str(&legacy).unwrap();
        assert_eq!(parsed.attempt, 0);
        assert!(!parsed.preserve_manual_category);
    }

    #[test]
    fn retryable_failures_requeue_until_attempts_run_out() {
        let err = JobError::Retryable(anyhow!("provider hiccup"));
        assert_eq!(retry_decision(0, &err), Some(1));
        assert_eq!(retry_decision(1, &err), Some(2));
        // Third failure exhausts the job.
        assert_eq!(retry_decision(2, &err), None);
    }

    #[test]
    fn terminal_failures_never_requeue() {
        let err = JobError::Terminal(anyhow!("ticket gone"));
        assert_eq!(retry_decision(0, &err), None);
        assert_eq!(retry_decision(MAX_ATTEMPTS - 1, &err), None);
    }

    #[tokio::test]
    async fn enqueue_surfaces_queue_failures() {
        // Nothing listens on port 1; a failed dispatch has to come back as an
        // error the worker can attribute to the ticket, not a silent drop.
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let job = ClassifyJob::new(Uuid::now_v7(), false);
        assert!(enqueue(&client, &job).await.is_err());
    }
}
