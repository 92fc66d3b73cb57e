//! Append-only review event log.
//!
//! Every noteworthy step of a review pass (retries, JSON repairs, timeouts,
//! batch stats, posting outcomes) lands here keyed by review id. Rows are
//! never updated; replay-based tests read them back in insertion order.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::Store;
use crate::errors::StoreResult;

/// Kinds of audit events a review pass can record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Retry,
    JsonRepair,
    Timeout,
    BatchStats,
    Posted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Retry => "retry",
            EventKind::JsonRepair => "json_repair",
            EventKind::Timeout => "timeout",
            EventKind::BatchStats => "batch_stats",
            EventKind::Posted => "posted",
        }
    }
}

/// One audit row, as read back from the log.
#[derive(Debug, Clone)]
pub struct ReviewEvent {
    pub review_id: String,
    pub kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Appends one event. The detail blob is stored as compact JSON.
    pub async fn record_event(
        &self,
        review_id: &str,
        kind: EventKind,
        detail: &serde_json::Value,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO review_events (review_id, kind, detail, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(review_id)
        .bind(kind.as_str())
        .bind(detail.to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Reads back all events for a review, oldest first.
    pub async fn events(&self, review_id: &str) -> StoreResult<Vec<ReviewEvent>> {
        let rows = sqlx::query(
            "SELECT review_id, kind, detail, created_at FROM review_events
             WHERE review_id = ? ORDER BY id ASC",
        )
        .bind(review_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|r| {
                Ok(ReviewEvent {
                    review_id: r.try_get("review_id")?,
                    kind: r.try_get("kind")?,
                    detail: r.try_get("detail")?,
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_append_and_read_in_order() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Store::from_pool(pool).await.unwrap();

        store
            .record_event(
                "rev-1",
                EventKind::JsonRepair,
                &serde_json::json!({"strategies": ["strip-trailing-commas", "balance-braces"]}),
            )
            .await
            .unwrap();
        store
            .record_event("rev-1", EventKind::BatchStats, &serde_json::json!({"batches": 3}))
            .await
            .unwrap();
        store
            .record_event("rev-2", EventKind::Timeout, &serde_json::json!({"attempt": 1}))
            .await
            .unwrap();

        let events = store.events("rev-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "json_repair");
        assert!(events[0].detail.contains("strip-trailing-commas"));
        assert_eq!(events[1].kind, "batch_stats");
    }
}
