use super::schema::Database;
use super::types::{DatabaseError, Subscriber, ValidationError};

impl Database {
    // ========================================================================
    // Subscriber Directory
    // ========================================================================

    /// Resolve an access key to its subscriber, if any.
    ///
    /// Read-only. Unknown and empty keys both yield `None`.
    pub async fn find_subscriber(&self, access_key: &str) -> Result<Option<Subscriber>, DatabaseError> {
        if access_key.is_empty() {
            return Ok(None);
        }

        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM subscribers WHERE access_key = ?")
            .bind(access_key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(id,)| Subscriber { id }))
    }

    /// Create a subscriber holding `access_key`, returning its id.
    ///
    /// # Errors
    ///
    /// `Validation(EmptyAccessKey)` for a blank key and
    /// `Validation(DuplicateAccessKey)` if another subscriber owns it.
    pub async fn add_subscriber(&self, access_key: &str) -> Result<i64, DatabaseError> {
        if access_key.trim().is_empty() {
            return Err(ValidationError::EmptyAccessKey.into());
        }

        let now = chrono::Utc::now().timestamp();
        let result: Result<(i64,), sqlx::Error> = sqlx::query_as(
            "INSERT INTO subscribers (access_key, created_at) VALUES (?, ?) RETURNING id",
        )
        .bind(access_key)
        .bind(now)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok((id,)) => {
                tracing::info!(subscriber_id = id, "Added subscriber");
                Ok(id)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ValidationError::DuplicateAccessKey.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}
