//! PostgreSQL number groups
//!
//! Atomic counters minting sequential job names per group.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use kiln_domain::{DomainError, DomainResult};
use kiln_ports::NumberGroup;

#[derive(Debug)]
pub struct PostgresNumberGroup {
    pool: PgPool,
}

impl PostgresNumberGroup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> DomainResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS number_groups (
                name TEXT PRIMARY KEY,
                val BIGINT NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot create number_groups table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl NumberGroup for PostgresNumberGroup {
    async fn next(&self, group: &str) -> DomainResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO number_groups (name, val)
            VALUES ($1, 0)
            ON CONFLICT (name) DO UPDATE
            SET val = number_groups.val + 1
            RETURNING val
        "#,
        )
        .bind(group)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot advance number group: {e}")))?;
        Ok(row.get("val"))
    }
}
