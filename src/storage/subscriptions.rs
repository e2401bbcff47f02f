use super::schema::Database;
use super::types::{DatabaseError, Source, SourceRow};

impl Database {
    // ========================================================================
    // Subscription Index
    // ========================================================================

    /// Subscribe a subscriber to a source.
    ///
    /// Idempotent: an existing pair is left alone. Returns `true` when a new
    /// subscription was created.
    ///
    /// # Errors
    ///
    /// `SourceNotFound` if `source_id` does not reference a registered source.
    pub async fn subscribe(&self, subscriber_id: i64, source_id: i64) -> Result<bool, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DatabaseError::SourceNotFound(source_id));
        }

        let result = sqlx::query(
            "INSERT OR IGNORE INTO subscriptions (subscriber_id, source_id) VALUES (?, ?)",
        )
        .bind(subscriber_id)
        .bind(source_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let created = result.rows_affected() > 0;
        tracing::debug!(
            subscriber_id = subscriber_id,
            source_id = source_id,
            created = created,
            "Subscribed"
        );
        Ok(created)
    }

    /// Remove a subscription if present. Unknown pairs are a no-op.
    ///
    /// Returns `true` when a subscription was removed.
    pub async fn unsubscribe(&self, subscriber_id: i64, source_id: i64) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM subscriptions WHERE subscriber_id = ? AND source_id = ?")
                .bind(subscriber_id)
                .bind(source_id)
                .execute(&self.pool)
                .await?;

        let removed = result.rows_affected() > 0;
        tracing::debug!(
            subscriber_id = subscriber_id,
            source_id = source_id,
            removed = removed,
            "Unsubscribed"
        );
        Ok(removed)
    }

    /// Sources a subscriber is subscribed to, with patterns, oldest first.
    pub async fn sources_for(&self, subscriber_id: i64) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.url, s.created_at
            FROM sources s
            JOIN subscriptions sub ON sub.source_id = s.id
            WHERE sub.subscriber_id = ?
            ORDER BY s.created_at, s.id
        "#,
        )
        .bind(subscriber_id)
        .fetch_all(&self.pool)
        .await?;

        self.attach_patterns(rows).await
    }
}
