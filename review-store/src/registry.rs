//! Connector and webhook registry.
//!
//! A connector binds a forge (`provider`) to an API base URL and an
//! integration token whose owning account is the bot identity. Webhook
//! secrets are stored per `(provider, integration_token_id)` and generated
//! when a connector is enabled. Credentials are fetched on demand by the
//! provider layers and never cached inside the core.

use chrono::Utc;
use sqlx::Row;

use crate::Store;
use crate::errors::{StoreError, StoreResult};

/// A connector joined with its integration token, as consumed by the
/// provider input/output layers.
#[derive(Debug, Clone)]
pub struct Connector {
    pub id: String,
    pub provider: String,
    pub api_base: String,
    pub enabled: bool,
    pub token: String,
    pub bot_user_id: String,
    pub bot_login: String,
}

impl Store {
    /// Creates a connector with its integration token. Used by ops tooling
    /// and tests; the web UI performing CRUD lives outside this service.
    pub async fn create_connector(
        &self,
        id: &str,
        provider: &str,
        api_base: &str,
        token: &str,
        bot_user_id: &str,
        bot_login: &str,
    ) -> StoreResult<i64> {
        sqlx::query(
            "INSERT INTO connectors (id, provider, api_base, enabled, created_at) VALUES (?, ?, ?, 1, ?)",
        )
        .bind(id)
        .bind(provider)
        .bind(api_base)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        let res = sqlx::query(
            "INSERT INTO integration_tokens (connector_id, token, bot_user_id, bot_login) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(token)
        .bind(bot_user_id)
        .bind(bot_login)
        .execute(self.pool())
        .await?;
        Ok(res.last_insert_rowid())
    }

    /// Stores the webhook secret for a connector's integration token.
    pub async fn set_webhook_secret(
        &self,
        provider: &str,
        integration_token_id: i64,
        secret: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO webhook_registry (provider, integration_token_id, secret)
               VALUES (?, ?, ?)
               ON CONFLICT (provider, integration_token_id) DO UPDATE SET secret = excluded.secret"#,
        )
        .bind(provider)
        .bind(integration_token_id)
        .bind(secret)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Looks up a connector (with token and bot identity) by provider + id.
    pub async fn connector(&self, provider: &str, connector_id: &str) -> StoreResult<Connector> {
        let row = sqlx::query(
            r#"SELECT c.id, c.provider, c.api_base, c.enabled,
                      t.token, t.bot_user_id, t.bot_login
               FROM connectors c
               JOIN integration_tokens t ON t.connector_id = c.id
               WHERE c.provider = ? AND c.id = ?"#,
        )
        .bind(provider)
        .bind(connector_id)
        .fetch_optional(self.pool())
        .await?;

        let row = row.ok_or_else(|| {
            StoreError::NotFound(format!("connector {provider}/{connector_id}"))
        })?;
        Ok(Connector {
            id: row.try_get("id")?,
            provider: row.try_get("provider")?,
            api_base: row.try_get("api_base")?,
            enabled: {
                let v: i64 = row.try_get("enabled")?;
                v != 0
            },
            token: row.try_get("token")?,
            bot_user_id: row.try_get("bot_user_id")?,
            bot_login: row.try_get("bot_login")?,
        })
    }

    /// First enabled connector for a provider. Manual triggers, which
    /// arrive with only an MR URL, resolve their credentials through this.
    pub async fn default_connector(&self, provider: &str) -> StoreResult<Connector> {
        let row = sqlx::query(
            r#"SELECT c.id, c.provider, c.api_base, c.enabled,
                      t.token, t.bot_user_id, t.bot_login
               FROM connectors c
               JOIN integration_tokens t ON t.connector_id = c.id
               WHERE c.provider = ? AND c.enabled = 1
               ORDER BY c.created_at ASC
               LIMIT 1"#,
        )
        .bind(provider)
        .fetch_optional(self.pool())
        .await?;

        let row = row
            .ok_or_else(|| StoreError::NotFound(format!("enabled connector for {provider}")))?;
        Ok(Connector {
            id: row.try_get("id")?,
            provider: row.try_get("provider")?,
            api_base: row.try_get("api_base")?,
            enabled: {
                let v: i64 = row.try_get("enabled")?;
                v != 0
            },
            token: row.try_get("token")?,
            bot_user_id: row.try_get("bot_user_id")?,
            bot_login: row.try_get("bot_login")?,
        })
    }

    /// Webhook secret for `(provider, connector_id)`, if one was generated.
    pub async fn webhook_secret(
        &self,
        provider: &str,
        connector_id: &str,
    ) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            r#"SELECT w.secret
               FROM webhook_registry w
               JOIN integration_tokens t ON t.id = w.integration_token_id
               WHERE w.provider = ? AND t.connector_id = ?"#,
        )
        .bind(provider)
        .bind(connector_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("secret")?),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connector_roundtrip_with_secret() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = Store::from_pool(pool).await.unwrap();

        let token_id = store
            .create_connector(
                "c1",
                "github",
                "https://api.github.com",
                "ghp_xxx",
                "9000",
                "livereview-bot",
            )
            .await
            .unwrap();
        store
            .set_webhook_secret("github", token_id, "s3cret")
            .await
            .unwrap();

        let c = store.connector("github", "c1").await.unwrap();
        assert_eq!(c.api_base, "https://api.github.com");
        assert_eq!(c.bot_login, "livereview-bot");
        assert!(c.enabled);

        let secret = store.webhook_secret("github", "c1").await.unwrap();
        assert_eq!(secret.as_deref(), Some("s3cret"));

        // Unknown connector is a typed error, not a default.
        assert!(store.connector("github", "nope").await.is_err());
        assert!(store.webhook_secret("gitlab", "c1").await.unwrap().is_none());
    }
}
