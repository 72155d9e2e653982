//! Basic-auth credential check against stored bcrypt password hashes.

use std::sync::Arc;

use thiserror::Error;
use tokio::task;

use crate::application::repos::{RepoError, UserCredentialRecord, UsersRepo};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum UserError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,
    #[error("failed to hash password: {0}")]
    Hashing(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub username: String,
}

#[derive(Clone)]
pub struct UserService {
    repo: Arc<dyn UsersRepo>,
    cost: u32,
}

impl UserService {
    pub fn new(repo: Arc<dyn UsersRepo>) -> Self {
        Self::with_cost(repo, bcrypt::DEFAULT_COST)
    }

    /// Service hashing new passwords with an explicit bcrypt work factor.
    pub fn with_cost(repo: Arc<dyn UsersRepo>, cost: u32) -> Self {
        Self { repo, cost }
    }

    /// Create the user, replacing the password of an existing one.
    pub async fn upsert_user(&self, username: &str, password: &str) -> Result<(), UserError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(UserError::EmptyUsername);
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(UserError::WeakPassword);
        }

        let password = password.to_string();
        let cost = self.cost;
        let password_hash = task::spawn_blocking(move || bcrypt::hash(password, cost))
            .await
            .map_err(|err| UserError::Hashing(err.to_string()))?
            .map_err(|err| UserError::Hashing(err.to_string()))?;

        self.repo
            .upsert_user(UserCredentialRecord {
                username: username.to_string(),
                password_hash,
            })
            .await?;
        Ok(())
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthenticatedUser, AuthError> {
        if username.is_empty() || password.is_empty() {
            return Err(AuthError::Missing);
        }

        let record = self
            .repo
            .find_user(username)
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?
            .ok_or(AuthError::Invalid)?;

        let candidate = password.to_string();
        let stored = record.password_hash;
        let matches = task::spawn_blocking(move || bcrypt::verify(candidate, &stored))
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?
            .unwrap_or(false);
        if !matches {
            return Err(AuthError::Invalid);
        }

        Ok(AuthenticatedUser {
            username: record.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryUsers {
        users: Mutex<HashMap<String, UserCredentialRecord>>,
    }

    #[async_trait]
    impl UsersRepo for MemoryUsers {
        async fn find_user(
            &self,
            username: &str,
        ) -> Result<Option<UserCredentialRecord>, RepoError> {
            Ok(self.users.lock().await.get(username).cloned())
        }

        async fn upsert_user(&self, record: UserCredentialRecord) -> Result<(), RepoError> {
            self.users
                .lock()
                .await
                .insert(record.username.clone(), record);
            Ok(())
        }
    }

    fn service() -> UserService {
        UserService::with_cost(Arc::new(MemoryUsers::default()), 4)
    }

    #[tokio::test]
    async fn stored_password_authenticates() {
        let service = service();
        service
            .upsert_user("ops", "correct horse battery")
            .await
            .expect("user created");

        let user = service
            .authenticate("ops", "correct horse battery")
            .await
            .expect("valid credentials");
        assert_eq!(user.username, "ops");
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_are_rejected() {
        let service = service();
        service
            .upsert_user("ops", "correct horse battery")
            .await
            .unwrap();

        assert!(matches!(
            service.authenticate("ops", "wrong password").await,
            Err(AuthError::Invalid)
        ));
        assert!(matches!(
            service.authenticate("nobody", "correct horse battery").await,
            Err(AuthError::Invalid)
        ));
        assert!(matches!(
            service.authenticate("", "").await,
            Err(AuthError::Missing)
        ));
    }

    #[tokio::test]
    async fn replacing_a_user_changes_the_password() {
        let service = service();
        service.upsert_user("ops", "first password").await.unwrap();
        service.upsert_user("ops", "second password").await.unwrap();

        assert!(service.authenticate("ops", "first password").await.is_err());
        assert!(service.authenticate("ops", "second password").await.is_ok());
    }

    #[tokio::test]
    async fn short_passwords_are_refused() {
        let service = service();
        assert!(matches!(
            service.upsert_user("ops", "short").await,
            Err(UserError::WeakPassword)
        ));
    }

    #[tokio::test]
    async fn stored_hash_is_bcrypt() {
        let repo = Arc::new(MemoryUsers::default());
        let service = UserService::with_cost(repo.clone(), 4);
        service
            .upsert_user("ops", "correct horse battery")
            .await
            .expect("user created");

        let record = repo.users.lock().await.get("ops").cloned().expect("stored");
        assert!(record.password_hash.starts_with("$2"));
        assert!(!record.password_hash.contains("correct horse battery"));
        assert!(bcrypt::verify("correct horse battery", &record.password_hash).unwrap());
    }

    #[tokio::test]
    async fn hashes_from_other_bcrypt_writers_authenticate() {
        let repo = Arc::new(MemoryUsers::default());
        repo.upsert_user(UserCredentialRecord {
            username: "legacy".to_string(),
            password_hash: bcrypt::hash("legacy password", 4).unwrap(),
        })
        .await
        .unwrap();

        let service = UserService::with_cost(repo, 4);
        assert!(service.authenticate("legacy", "legacy password").await.is_ok());
        assert!(matches!(
            service.authenticate("legacy", "not it").await,
            Err(AuthError::Invalid)
        ));
    }

    #[tokio::test]
    async fn malformed_stored_hash_is_rejected() {
        let repo = Arc::new(MemoryUsers::default());
        repo.upsert_user(UserCredentialRecord {
            username: "broken".to_string(),
            password_hash: "not-a-bcrypt-hash".to_string(),
        })
        .await
        .unwrap();

        let service = UserService::with_cost(repo, 4);
        assert!(matches!(
            service.authenticate("broken", "anything goes").await,
            Err(AuthError::Invalid)
        ));
    }
}
