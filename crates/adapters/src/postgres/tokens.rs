//! PostgreSQL token store

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use kiln_domain::{DomainError, DomainResult};
use kiln_ports::TokenStore;

#[derive(Debug)]
pub struct PostgresTokenStore {
    pool: PgPool,
}

impl PostgresTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> DomainResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_tokens (
                token TEXT PRIMARY KEY,
                user_name TEXT NOT NULL,
                created TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot create user_tokens table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PostgresTokenStore {
    /// Stores a user token. Previous tokens of the same user stay valid.
    async fn store(&self, token: &str, user: &str) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT
            INTO   user_tokens (token, user_name)
            VALUES             ($1   , $2       )
        "#,
        )
        .bind(token)
        .bind(user)
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot store token: {e}")))?;
        Ok(())
    }

    async fn get(&self, token: &str) -> DomainResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT user_name
            FROM   user_tokens
            WHERE  token = $1
        "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot resolve token: {e}")))?;
        Ok(row.map(|row| row.get("user_name")))
    }

    async fn prune(&self, max_age: chrono::Duration) -> DomainResult<()> {
        sqlx::query(
            r#"
            DELETE
            FROM  user_tokens
            WHERE created < NOW() - CAST($1 AS INTERVAL)
        "#,
        )
        .bind(format!("{} seconds", max_age.num_seconds()))
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot prune tokens: {e}")))?;
        Ok(())
    }
}
