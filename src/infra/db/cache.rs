use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use time::OffsetDateTime;

use crate::application::repos::{CacheRepo, CachedResponse, RepoError};
use crate::domain::identity::CacheIdentity;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CacheRow {
    response: Json<Value>,
    created_at: OffsetDateTime,
}

impl From<CacheRow> for CachedResponse {
    fn from(row: CacheRow) -> Self {
        Self {
            response: row.response.0,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl CacheRepo for PostgresRepositories {
    async fn find_fresh(
        &self,
        identity: &CacheIdentity,
        fresh_since: OffsetDateTime,
    ) -> Result<Option<CachedResponse>, RepoError> {
        let row = sqlx::query_as::<_, CacheRow>(
            r#"
            SELECT response, created_at
              FROM api_cache
             WHERE object_name = $1
               AND account_code = $2
               AND event_code IS NOT DISTINCT FROM $3
               AND identifier_code IS NOT DISTINCT FROM $4
               AND query_params = $5
               AND created_at >= $6
             ORDER BY created_at DESC
             LIMIT 1
            "#,
        )
        .bind(&identity.object)
        .bind(&identity.account_code)
        .bind(identity.event_code.as_deref())
        .bind(identity.identifier_code.as_deref())
        .bind(identity.query_params.canonical())
        .bind(fresh_since)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(Into::into))
    }

    async fn upsert(&self, identity: &CacheIdentity, response: &Value) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO api_cache (
                object_name, account_code, event_code, identifier_code, query_params,
                response, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT ON CONSTRAINT api_cache_identity_key
            DO UPDATE SET response = EXCLUDED.response,
                          created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&identity.object)
        .bind(&identity.account_code)
        .bind(identity.event_code.as_deref())
        .bind(identity.identifier_code.as_deref())
        .bind(identity.query_params.canonical())
        .bind(Json(response))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn delete_created_before(&self, cutoff: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM api_cache WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_by_event(&self, event_code: &str) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM api_cache WHERE event_code = $1")
            .bind(event_code)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        self.ping().await.map_err(map_sqlx_error)
    }
}
