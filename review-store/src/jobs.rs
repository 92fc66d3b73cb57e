//! Transactional review-job queue.
//!
//! Semantics:
//! - `enqueue` is idempotent on `idempotency_key`: a duplicate delivery
//!   returns the id of the job already holding the key (whatever its state)
//!   so duplicate webhooks never cause duplicate review passes.
//! - `lease` atomically claims the oldest runnable job for a worker, with a
//!   lease expiry. Expired leases are reclaimable by any worker.
//! - `complete` / `fail` check the caller still holds the lease; a lost
//!   lease surfaces as [`StoreError::LeaseLost`] and the worker must stop
//!   the iteration without posting anything.
//! - After the retry budget, a failed job is discarded and a terminal audit
//!   row is written to `review_events`.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::Store;
use crate::errors::{StoreError, StoreResult};
use crate::events::EventKind;

/// Retry budget: a job failing this many attempts is discarded.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 5;

/// Lifecycle state of a review job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Available,
    Running,
    Completed,
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
        }
    }

    fn parse(s: &str) -> JobState {
        match s {
            "running" => JobState::Running,
            "completed" => JobState::Completed,
            "discarded" => JobState::Discarded,
            _ => JobState::Available,
        }
    }
}

/// One queue record. The payload is an opaque JSON blob owned by the
/// enqueuing side (the pipeline deserializes it back into its job type).
#[derive(Debug, Clone)]
pub struct ReviewJob {
    pub id: String,
    pub idempotency_key: String,
    pub payload: String,
    pub state: JobState,
    pub attempt: i64,
    pub next_run_at: DateTime<Utc>,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

fn job_from_row(row: &SqliteRow) -> Result<ReviewJob, sqlx::Error> {
    let state: String = row.try_get("state")?;
    Ok(ReviewJob {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        payload: row.try_get("payload")?,
        state: JobState::parse(&state),
        attempt: row.try_get("attempt")?,
        next_run_at: row.try_get("next_run_at")?,
        leased_by: row.try_get("leased_by")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}

/// Exponential backoff for retries: 30s, 60s, 120s, ... capped at 15 min.
fn retry_backoff(attempt: i64) -> Duration {
    let secs = 30i64.saturating_mul(1i64 << attempt.clamp(0, 5));
    Duration::seconds(secs.min(900))
}

impl Store {
    /// Enqueues a review job, deduplicating on `idempotency_key`.
    ///
    /// Returns the job id — either a freshly created one, or the id of the
    /// job that already holds the key.
    pub async fn enqueue(&self, idempotency_key: &str, payload: &str) -> StoreResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"INSERT INTO review_jobs
               (id, idempotency_key, payload, state, attempt, next_run_at, created_at, updated_at)
               VALUES (?, ?, ?, 'available', 0, ?, ?, ?)
               ON CONFLICT (idempotency_key) DO NOTHING"#,
        )
        .bind(&id)
        .bind(idempotency_key)
        .bind(payload)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        if inserted.rows_affected() == 1 {
            debug!(job_id = %id, key = %idempotency_key, "job enqueued");
            return Ok(id);
        }

        // Duplicate delivery: hand back the existing job for this key.
        let row = sqlx::query("SELECT id FROM review_jobs WHERE idempotency_key = ?")
            .bind(idempotency_key)
            .fetch_one(self.pool())
            .await?;
        let existing: String = row.try_get("id")?;
        debug!(job_id = %existing, key = %idempotency_key, "duplicate enqueue, reusing job");
        Ok(existing)
    }

    /// Atomically leases the oldest runnable job for `worker_id`.
    ///
    /// Runnable means `available` with `next_run_at` due, or `running` with
    /// an expired lease (crashed worker). Returns `None` when the queue has
    /// nothing due.
    pub async fn lease(
        &self,
        worker_id: &str,
        lease_duration: std::time::Duration,
    ) -> StoreResult<Option<ReviewJob>> {
        let now = Utc::now();
        let expires = now
            + Duration::from_std(lease_duration).unwrap_or_else(|_| Duration::seconds(60));

        let row = sqlx::query(
            r#"UPDATE review_jobs
               SET state = 'running', leased_by = ?, lease_expires_at = ?,
                   attempt = attempt + 1, updated_at = ?
               WHERE id = (
                   SELECT id FROM review_jobs
                   WHERE (state = 'available' AND next_run_at <= ?)
                      OR (state = 'running' AND lease_expires_at <= ?)
                   ORDER BY next_run_at ASC
                   LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(worker_id)
        .bind(expires)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(r) => {
                let job = job_from_row(&r)?;
                debug!(job_id = %job.id, worker = %worker_id, attempt = job.attempt, "job leased");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Marks a leased job completed. Fails with [`StoreError::LeaseLost`]
    /// when the lease was reclaimed in the meantime.
    pub async fn complete(&self, job_id: &str, worker_id: &str) -> StoreResult<()> {
        let res = sqlx::query(
            r#"UPDATE review_jobs SET state = 'completed', updated_at = ?
               WHERE id = ? AND leased_by = ? AND state = 'running'"#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .bind(worker_id)
        .execute(self.pool())
        .await?;

        if res.rows_affected() == 0 {
            return Err(StoreError::LeaseLost {
                job_id: job_id.to_string(),
            });
        }
        info!(job_id = %job_id, "job completed");
        Ok(())
    }

    /// Fails a leased job.
    ///
    /// Retryable failures within the budget reschedule the job with
    /// exponential backoff; anything else discards it and writes a terminal
    /// `posted` audit row carrying the error.
    pub async fn fail(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> StoreResult<()> {
        let row = sqlx::query("SELECT attempt FROM review_jobs WHERE id = ? AND leased_by = ? AND state = 'running'")
            .bind(job_id)
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?;

        let attempt: i64 = match row {
            Some(r) => r.try_get("attempt")?,
            None => {
                return Err(StoreError::LeaseLost {
                    job_id: job_id.to_string(),
                });
            }
        };

        if retryable && attempt < DEFAULT_MAX_ATTEMPTS {
            let next = Utc::now() + retry_backoff(attempt);
            sqlx::query(
                r#"UPDATE review_jobs
                   SET state = 'available', leased_by = NULL, lease_expires_at = NULL,
                       next_run_at = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(next)
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
            warn!(job_id = %job_id, attempt, error = %error, "job failed, retry scheduled");
        } else {
            sqlx::query(
                r#"UPDATE review_jobs
                   SET state = 'discarded', leased_by = NULL, lease_expires_at = NULL, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(Utc::now())
            .bind(job_id)
            .execute(self.pool())
            .await?;
            self.record_event(
                job_id,
                EventKind::Posted,
                &serde_json::json!({ "discarded": true, "attempt": attempt, "error": error }),
            )
            .await?;
            warn!(job_id = %job_id, attempt, error = %error, "job discarded after retry budget");
        }
        Ok(())
    }

    /// Number of jobs waiting to run. Backs the manual-trigger watermark.
    pub async fn queue_depth(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM review_jobs WHERE state = 'available'")
            .fetch_one(self.pool())
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Fetches a job by id.
    pub async fn job(&self, job_id: &str) -> StoreResult<Option<ReviewJob>> {
        let row = sqlx::query("SELECT * FROM review_jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(match row {
            Some(r) => Some(job_from_row(&r)?),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> Store {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        Store::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn enqueue_dedupes_on_idempotency_key() {
        let store = memory_store().await;
        let a = store.enqueue("gh:1:42:def456:updated", "{}").await.unwrap();
        let b = store.enqueue("gh:1:42:def456:updated", "{}").await.unwrap();
        assert_eq!(a, b, "duplicate delivery must reuse the existing job");

        let c = store.enqueue("gh:1:42:other:updated", "{}").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn lease_transitions_available_to_running() {
        let store = memory_store().await;
        let id = store.enqueue("k1", r#"{"x":1}"#).await.unwrap();

        let job = store
            .lease("w1", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .expect("job should be leasable");
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.attempt, 1);
        assert_eq!(job.leased_by.as_deref(), Some("w1"));

        // Nothing else is runnable while the lease holds.
        let none = store
            .lease("w2", std::time::Duration::from_secs(60))
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let store = memory_store().await;
        store.enqueue("k1", "{}").await.unwrap();

        let first = store
            .lease("w1", std::time::Duration::from_secs(0))
            .await
            .unwrap()
            .unwrap();
        // Zero-duration lease expires immediately; another worker reclaims.
        let second = store
            .lease("w2", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .expect("expired lease must be reclaimable");
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt, 2);

        // The original worker's lease is gone.
        let err = store.complete(&first.id, "w1").await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
    }

    #[tokio::test]
    async fn complete_finishes_job() {
        let store = memory_store().await;
        let id = store.enqueue("k1", "{}").await.unwrap();
        store
            .lease("w1", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.complete(&id, "w1").await.unwrap();

        let job = store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(store
            .lease("w2", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fail_retryable_schedules_backoff() {
        let store = memory_store().await;
        let id = store.enqueue("k1", "{}").await.unwrap();
        store
            .lease("w1", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.fail(&id, "w1", "forge 502", true).await.unwrap();

        let job = store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Available);
        assert!(job.next_run_at > Utc::now(), "backoff must push next_run_at");

        // Not leasable before next_run_at.
        assert!(store
            .lease("w1", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fail_past_budget_discards_with_terminal_event() {
        let store = memory_store().await;
        let id = store.enqueue("k1", "{}").await.unwrap();

        // Burn through the retry budget with immediately-expiring leases.
        for _ in 0..DEFAULT_MAX_ATTEMPTS {
            let job = store
                .lease("w1", std::time::Duration::from_secs(0))
                .await
                .unwrap()
                .unwrap();
            // Force the job runnable again regardless of backoff.
            sqlx::query("UPDATE review_jobs SET state='running', next_run_at=? WHERE id=?")
                .bind(Utc::now())
                .bind(&job.id)
                .execute(store.pool())
                .await
                .unwrap();
        }
        store.fail(&id, "w1", "poison payload", true).await.unwrap();

        let job = store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);

        let events = store.events(&id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "posted");
        assert!(events[0].detail.contains("poison payload"));
    }

    #[tokio::test]
    async fn non_retryable_failure_discards_immediately() {
        let store = memory_store().await;
        let id = store.enqueue("k1", "{}").await.unwrap();
        store
            .lease("w1", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        store.fail(&id, "w1", "401 from forge", false).await.unwrap();

        let job = store.job(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Discarded);
    }

    #[tokio::test]
    async fn queue_depth_counts_available_only() {
        let store = memory_store().await;
        store.enqueue("a", "{}").await.unwrap();
        store.enqueue("b", "{}").await.unwrap();
        assert_eq!(store.queue_depth().await.unwrap(), 2);

        store
            .lease("w1", std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.queue_depth().await.unwrap(), 1);
    }
}
