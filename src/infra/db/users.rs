use async_trait::async_trait;

use crate::application::repos::{RepoError, UserCredentialRecord, UsersRepo};

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct UserRow {
    username: String,
    password_hash: String,
}

#[async_trait]
impl UsersRepo for PostgresRepositories {
    async fn find_user(&self, username: &str) -> Result<Option<UserCredentialRecord>, RepoError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT username, password_hash FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|row| UserCredentialRecord {
            username: row.username,
            password_hash: row.password_hash,
        }))
    }

    async fn upsert_user(&self, record: UserCredentialRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO users (username, password_hash)
            VALUES ($1, $2)
            ON CONFLICT (username)
            DO UPDATE SET password_hash = EXCLUDED.password_hash,
                          updated_at = now()
            "#,
        )
        .bind(&record.username)
        .bind(&record.password_hash)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}
