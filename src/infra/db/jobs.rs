use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::application::jobs::FETCH_JOB_NAMESPACE;
use crate::application::repos::{FetchJobsRepo, FetchQueueCounts, RepoError};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CountsRow {
    running: i64,
    pending: i64,
    scheduled: i64,
}

#[async_trait]
impl FetchJobsRepo for PostgresRepositories {
    async fn enqueue_fetch_job(
        &self,
        payload: Value,
        run_at: OffsetDateTime,
        max_attempts: i32,
    ) -> Result<String, RepoError> {
        sqlx::query_scalar::<_, String>(
            "SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id",
        )
        .bind(FETCH_JOB_NAMESPACE)
        .bind(Json(payload))
        .bind("Pending")
        .bind(run_at)
        .bind(max_attempts)
        .bind(0_i32)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn store_fetch_result(
        &self,
        ticket: Uuid,
        response: Option<&Value>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO upstream_fetch_results (ticket, response, completed_at)
            VALUES ($1, $2, now())
            ON CONFLICT (ticket)
            DO UPDATE SET response = EXCLUDED.response,
                          completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(ticket)
        .bind(response.map(Json))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn take_fetch_result(&self, ticket: Uuid) -> Result<Option<Option<Value>>, RepoError> {
        let row = sqlx::query_scalar::<_, Option<Json<Value>>>(
            "DELETE FROM upstream_fetch_results WHERE ticket = $1 RETURNING response",
        )
        .bind(ticket)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|response| response.map(|json| json.0)))
    }

    async fn fetch_queue_counts(&self) -> Result<FetchQueueCounts, RepoError> {
        let row = sqlx::query_as::<_, CountsRow>(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'Running') AS running,
                COUNT(*) FILTER (WHERE status = 'Pending' AND run_at <= now()) AS pending,
                COUNT(*) FILTER (WHERE status = 'Pending' AND run_at > now()) AS scheduled
              FROM apalis.jobs
             WHERE job_type = $1
            "#,
        )
        .bind(FETCH_JOB_NAMESPACE)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(FetchQueueCounts {
            running: Self::convert_count(row.running)?,
            pending: Self::convert_count(row.pending)?,
            scheduled: Self::convert_count(row.scheduled)?,
        })
    }

    async fn purge_fetch_results_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM upstream_fetch_results WHERE completed_at < $1")
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
