//! Learnings store.
//!
//! The learning extractor writes structured guidance distilled from
//! reviewer follow-ups (pattern, preferred style, optional counter-example)
//! scoped to a repository. Prompt assembly reads the most recent entries
//! back when composing later reviews.

use chrono::Utc;
use sqlx::Row;

use crate::Store;
use crate::errors::StoreResult;

/// One stored learning.
#[derive(Debug, Clone)]
pub struct Learning {
    pub provider: String,
    pub repo_id: String,
    pub pattern: String,
    pub preferred_style: String,
    pub counter_example: Option<String>,
}

impl Store {
    /// Records a learning for a repository.
    pub async fn add_learning(&self, learning: &Learning) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO learnings
               (provider, repo_id, pattern, preferred_style, counter_example, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&learning.provider)
        .bind(&learning.repo_id)
        .bind(&learning.pattern)
        .bind(&learning.preferred_style)
        .bind(&learning.counter_example)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Most recent learnings for a repository, newest first.
    pub async fn learnings(
        &self,
        provider: &str,
        repo_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<Learning>> {
        let rows = sqlx::query(
            r#"SELECT provider, repo_id, pattern, preferred_style, counter_example
               FROM learnings
               WHERE provider = ? AND repo_id = ?
               ORDER BY id DESC LIMIT ?"#,
        )
        .bind(provider)
        .bind(repo_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|r| {
                Ok(Learning {
                    provider: r.try_get("provider")?,
                    repo_id: r.try_get("repo_id")?,
                    pattern: r.try_get("pattern")?,
                    preferred_style: r.try_get("preferred_style")?,
                    counter_example: r.try_get("counter_example")?,
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
    async fn learnings_scoped_by_repo() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Store::from_pool(pool).await.unwrap();

        store
            .add_learning(&Learning {
                provider: "github".into(),
                repo_id: "1".into(),
                pattern: "error handling".into(),
                preferred_style: "propagate with ? instead of unwrap".into(),
                counter_example: Some("unwrap() in request handler".into()),
            })
            .await
            .unwrap();
        store
            .add_learning(&Learning {
                provider: "gitlab".into(),
                repo_id: "1".into(),
                pattern: "naming".into(),
                preferred_style: "snake_case module names".into(),
                counter_example: None,
            })
            .await
            .unwrap();

        let found = store.learnings("github", "1", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern, "error handling");
    }
}
