//! PostgreSQL job store
//!
//! Statuses are stored as one JSONB blob per job, with the filterable
//! fields extracted into columns. The filter language compiles to SQL
//! predicates so ListJobs and Subscribe agree on semantics.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::info;

use kiln_domain::{
    DomainError, DomainResult, FilterExpression, FilterOp, FilterTerm, JobStatus, OrderExpression,
};
use kiln_ports::JobStore;

#[derive(Debug)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> DomainResult<()> {
        info!("initializing job schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL DEFAULT '',
                phase TEXT NOT NULL DEFAULT '',
                success BOOLEAN NOT NULL DEFAULT FALSE,
                repo_host TEXT NOT NULL DEFAULT '',
                repo_owner TEXT NOT NULL DEFAULT '',
                repo_repo TEXT NOT NULL DEFAULT '',
                repo_ref TEXT NOT NULL DEFAULT '',
                repo_revision TEXT NOT NULL DEFAULT '',
                trigger_kind TEXT NOT NULL DEFAULT '',
                created TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                data JSONB NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot create jobs table: {e}")))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_created
            ON jobs(created)
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot create jobs index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_specs (
                name TEXT PRIMARY KEY,
                data BYTEA NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot create job_specs table: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn store(&self, status: &JobStatus) -> DomainResult<()> {
        let data = serde_json::to_value(status)
            .map_err(|e| DomainError::Store(format!("cannot serialize status: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (name, owner, phase, success, repo_host, repo_owner,
                              repo_repo, repo_ref, repo_revision, trigger_kind, created, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (name) DO UPDATE
            SET owner = EXCLUDED.owner,
                phase = EXCLUDED.phase,
                success = EXCLUDED.success,
                repo_host = EXCLUDED.repo_host,
                repo_owner = EXCLUDED.repo_owner,
                repo_repo = EXCLUDED.repo_repo,
                repo_ref = EXCLUDED.repo_ref,
                repo_revision = EXCLUDED.repo_revision,
                trigger_kind = EXCLUDED.trigger_kind,
                created = EXCLUDED.created,
                data = EXCLUDED.data
        "#,
        )
        .bind(&status.name)
        .bind(&status.metadata.owner)
        .bind(status.phase.as_str())
        .bind(status.conditions.success)
        .bind(&status.metadata.repository.host)
        .bind(&status.metadata.repository.owner)
        .bind(&status.metadata.repository.repo)
        .bind(&status.metadata.repository.ref_)
        .bind(&status.metadata.repository.revision)
        .bind(status.metadata.trigger.as_str())
        .bind(status.metadata.created.unwrap_or_else(chrono::Utc::now))
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot store job: {e}")))?;

        Ok(())
    }

    async fn get(&self, name: &str) -> DomainResult<Option<JobStatus>> {
        let row = sqlx::query("SELECT data FROM jobs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Store(format!("cannot get job: {e}")))?;

        row.map(|row| {
            serde_json::from_value(row.get("data"))
                .map_err(|e| DomainError::Store(format!("cannot deserialize status: {e}")))
        })
        .transpose()
    }

    async fn store_job_spec(&self, name: &str, spec: Vec<u8>) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_specs (name, data)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET data = EXCLUDED.data
        "#,
        )
        .bind(name)
        .bind(spec)
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Store(format!("cannot store job spec: {e}")))?;
        Ok(())
    }

    async fn get_job_spec(&self, name: &str) -> DomainResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT data FROM job_specs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Store(format!("cannot get job spec: {e}")))?;
        Ok(row.map(|row| row.get("data")))
    }

    async fn find(
        &self,
        filter: &[FilterExpression],
        order: &[OrderExpression],
        start: i64,
        limit: i64,
    ) -> DomainResult<(Vec<JobStatus>, i64)> {
        let mut binds = Vec::new();
        let clause = build_where(filter, &mut binds)?;
        let order_by = build_order(order);

        let count_sql = format!("SELECT COUNT(*) AS total FROM jobs WHERE {clause}");
        let mut count_query = sqlx::query(&count_sql);
        for bind in &binds {
            count_query = count_query.bind(bind.as_str());
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DomainError::Store(format!("cannot count jobs: {e}")))?
            .get("total");

        let select_sql = format!(
            "SELECT data FROM jobs WHERE {clause} ORDER BY {order_by} OFFSET ${} LIMIT ${}",
            binds.len() + 1,
            binds.len() + 2,
        );
        let mut select_query = sqlx::query(&select_sql);
        for bind in &binds {
            select_query = select_query.bind(bind.as_str());
        }
        let rows = select_query
            .bind(start)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DomainError::Store(format!("cannot list jobs: {e}")))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let status = serde_json::from_value(row.get("data"))
                .map_err(|e| DomainError::Store(format!("cannot deserialize status: {e}")))?;
            jobs.push(status);
        }
        Ok((jobs, total))
    }
}

/// Compiles filter expressions into a SQL predicate. All expressions and
/// all terms AND together; unknown fields never match.
fn build_where(filter: &[FilterExpression], binds: &mut Vec<String>) -> DomainResult<String> {
    let mut clauses = Vec::new();
    for expr in filter {
        for term in &expr.terms {
            clauses.push(term_to_sql(term, binds)?);
        }
    }
    if clauses.is_empty() {
        return Ok("TRUE".to_string());
    }
    Ok(clauses.join(" AND "))
}

fn term_to_sql(term: &FilterTerm, binds: &mut Vec<String>) -> DomainResult<String> {
    if let Some(key) = term.field.strip_prefix("annotation.") {
        binds.push(key.to_string());
        let key_param = binds.len();
        let value_pred = op_to_sql("a.value ->> 'value'", term.operation, &term.value, binds);
        let clause = format!(
            "EXISTS (SELECT 1 FROM jsonb_array_elements(data -> 'metadata' -> 'annotations') a \
             WHERE (a.value ->> 'key' = ${key_param} \
                    OR a.value ->> 'key' = 'userdata.kiln.dev/' || ${key_param}) \
               AND {value_pred})"
        );
        return Ok(wrap_negation(clause, term.negate));
    }

    let column = match term.field.as_str() {
        "name" => "name",
        "owner" => "owner",
        "phase" => "phase",
        "success" => "success::text",
        "repo.host" => "repo_host",
        "repo.owner" => "repo_owner",
        "repo.repo" => "repo_repo",
        "repo.ref" => "repo_ref",
        "repo.revision" => "repo_revision",
        "trigger" => "trigger_kind",
        // unknown fields yield no match
        _ => return Ok("FALSE".to_string()),
    };

    Ok(wrap_negation(
        op_to_sql(column, term.operation, &term.value, binds),
        term.negate,
    ))
}

fn op_to_sql(column: &str, op: FilterOp, value: &str, binds: &mut Vec<String>) -> String {
    match op {
        FilterOp::Exists => format!("{column} <> ''"),
        FilterOp::Equals => {
            binds.push(value.to_string());
            format!("{column} = ${}", binds.len())
        }
        FilterOp::StartsWith => {
            binds.push(format!("{}%", escape_like(value)));
            format!("{column} LIKE ${}", binds.len())
        }
        FilterOp::EndsWith => {
            binds.push(format!("%{}", escape_like(value)));
            format!("{column} LIKE ${}", binds.len())
        }
        FilterOp::Contains => {
            binds.push(format!("%{}%", escape_like(value)));
            format!("{column} LIKE ${}", binds.len())
        }
    }
}

fn wrap_negation(clause: String, negate: bool) -> String {
    if negate {
        format!("NOT ({clause})")
    } else {
        clause
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn build_order(order: &[OrderExpression]) -> String {
    let mut parts = Vec::new();
    for expr in order {
        let column = match expr.field.as_str() {
            "name" => "name",
            "owner" => "owner",
            "phase" => "phase",
            "success" => "success",
            "created" => "created",
            "trigger" => "trigger_kind",
            _ => continue,
        };
        let direction = if expr.ascending { "ASC" } else { "DESC" };
        parts.push(format!("{column} {direction}"));
    }
    if parts.is_empty() {
        return "created DESC".to_string();
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn term(field: &str, op: FilterOp, value: &str) -> FilterTerm {
        FilterTerm {
            field: field.to_string(),
            value: value.to_string(),
            operation: op,
            negate: false,
        }
    }

    #[test]
    fn empty_filters_match_everything() {
        let mut binds = Vec::new();
        assert_eq!(build_where(&[], &mut binds).unwrap(), "TRUE");
        assert!(binds.is_empty());
    }

    #[test]
    fn terms_become_positional_predicates() {
        let filter = vec![FilterExpression {
            terms: vec![
                term("owner", FilterOp::Equals, "jane"),
                term("name", FilterOp::StartsWith, "alpha"),
            ],
        }];
        let mut binds = Vec::new();
        let clause = build_where(&filter, &mut binds).unwrap();
        assert_eq!(clause, "owner = $1 AND name LIKE $2");
        assert_eq!(binds, vec!["jane".to_string(), "alpha%".to_string()]);
    }

    #[test]
    fn unknown_fields_compile_to_false() {
        let filter = vec![FilterExpression {
            terms: vec![term("bogus", FilterOp::Equals, "x")],
        }];
        let mut binds = Vec::new();
        assert_eq!(build_where(&filter, &mut binds).unwrap(), "FALSE");
    }

    #[test]
    fn negation_wraps_the_predicate() {
        let mut t = term("phase", FilterOp::Equals, "done");
        t.negate = true;
        let filter = vec![FilterExpression { terms: vec![t] }];
        let mut binds = Vec::new();
        assert_eq!(
            build_where(&filter, &mut binds).unwrap(),
            "NOT (phase = $1)"
        );
    }

    #[test]
    fn like_values_are_escaped() {
        let filter = vec![FilterExpression {
            terms: vec![term("name", FilterOp::Contains, "100%_done")],
        }];
        let mut binds = Vec::new();
        build_where(&filter, &mut binds).unwrap();
        assert_eq!(binds, vec!["%100\\%\\_done%".to_string()]);
    }

    #[test]
    fn annotation_terms_search_the_jsonb() {
        let filter = vec![FilterExpression {
            terms: vec![term("annotation.team", FilterOp::Equals, "platform")],
        }];
        let mut binds = Vec::new();
        let clause = build_where(&filter, &mut binds).unwrap();
        assert!(clause.contains("jsonb_array_elements"));
        assert!(clause.contains("userdata.kiln.dev/"));
        assert_eq!(binds, vec!["team".to_string(), "platform".to_string()]);
    }

    #[test]
    fn order_falls_back_to_created_desc() {
        assert_eq!(build_order(&[]), "created DESC");
        assert_eq!(
            build_order(&[OrderExpression {
                field: "name".to_string(),
                ascending: true,
            }]),
            "name ASC"
        );
    }
}
