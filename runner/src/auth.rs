//! Worker authentication and security for the runner.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;

use crate::database::RunnerDatabase;

/// Worker authentication information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerAuth {
    /// Worker name/username.
    pub name: String,
    /// Optional worker link/URL.
    pub link: Option<String>,
}

/// Authentication errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Missing authorization header.
    #[error("Missing authorization header")]
    MissingAuth,

    /// Invalid authorization header format.
    #[error("Invalid authorization header format")]
    InvalidFormat,

    /// Invalid credentials.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Database error during authentication.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// UTF-8 decode error.
    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Worker authentication service.
pub struct WorkerAuthService {
    database: Arc<RunnerDatabase>,
}

impl WorkerAuthService {
    /// Create a new worker authentication service.
    pub fn new(database: Arc<RunnerDatabase>) -> Self {
        Self { database }
    }

    /// Authenticate a worker using HTTP Basic Auth.
    pub async fn authenticate_worker(&self, auth_header: &str) -> Result<WorkerAuth, AuthError> {
        let (username, password) = parse_basic_auth(auth_header)?;

        let worker_info = self.verify_worker_credentials(&username, &password).await?;

        match worker_info {
            Some(auth) => Ok(auth),
            None => Err(AuthError::InvalidCredentials),
        }
    }

    /// Authenticate a worker for a specific run using its upload token.
    ///
    /// Accepts either the per-run bearer token handed out with the
    /// assignment, or regular worker credentials belonging to the run's
    /// assignee.
    pub async fn authenticate_run(
        &self,
        run_id: &str,
        auth_header: &str,
    ) -> Result<WorkerAuth, AuthError> {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            let row = sqlx::query(
                "SELECT worker_name, worker_link FROM active_run WHERE id = $1 AND token = $2",
            )
            .bind(run_id)
            .bind(token)
            .fetch_optional(self.database.pool())
            .await?;
            return match row {
                Some(row) => Ok(WorkerAuth {
                    name: row.get("worker_name"),
                    link: row.get("worker_link"),
                }),
                None => Err(AuthError::InvalidCredentials),
            };
        }
        self.authenticate_worker(auth_header).await
    }

    /// Verify worker credentials against the database.
    async fn verify_worker_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<WorkerAuth>, AuthError> {
        let row = sqlx::query(
            "SELECT name, link FROM worker WHERE name = $1 AND password = crypt($2, password)",
        )
        .bind(username)
        .bind(password)
        .fetch_optional(self.database.pool())
        .await?;

        if let Some(row) = row {
            let name: String = row.get("name");
            let link: Option<String> = row.get("link");

            Ok(Some(WorkerAuth { name, link }))
        } else {
            Ok(None)
        }
    }

    /// Create a new worker account (for admin operations).
    pub async fn create_worker(
        &self,
        name: &str,
        password: &str,
        link: Option<&str>,
    ) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO worker (name, password, link) VALUES ($1, crypt($2, gen_salt('bf')), $3)",
        )
        .bind(name)
        .bind(password)
        .bind(link)
        .execute(self.database.pool())
        .await?;

        log::info!("Created worker account: {}", name);
        Ok(())
    }
}

/// Parse an HTTP Basic Auth header.
fn parse_basic_auth(auth_header: &str) -> Result<(String, String), AuthError> {
    let encoded = auth_header
        .strip_prefix("Basic ")
        .ok_or(AuthError::InvalidFormat)?;

    let decoded = general_purpose::STANDARD.decode(encoded)?;
    let decoded_str = std::str::from_utf8(&decoded)?;

    let (username, password) = decoded_str
        .split_once(':')
        .ok_or(AuthError::InvalidFormat)?;

    Ok((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_auth() {
        let header = format!(
            "Basic {}",
            general_purpose::STANDARD.encode("worker-1:hunter2")
        );
        let (user, password) = parse_basic_auth(&header).unwrap();
        assert_eq!(user, "worker-1");
        assert_eq!(password, "hunter2");
    }

    #[test]
    fn test_parse_basic_auth_rejects_garbage() {
        assert!(matches!(
            parse_basic_auth("Bearer abc"),
            Err(AuthError::InvalidFormat)
        ));
        assert!(matches!(
            parse_basic_auth("Basic !!!"),
            Err(AuthError::Base64(_))
        ));
        let no_colon = format!("Basic {}", general_purpose::STANDARD.encode("worker-1"));
        assert!(matches!(
            parse_basic_auth(&no_colon),
            Err(AuthError::InvalidFormat)
        ));
    }
}
