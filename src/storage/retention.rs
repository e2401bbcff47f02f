use super::schema::Database;
use super::types::{DatabaseError, SweepReport};

impl Database {
    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete every source created before `cutoff` (unix seconds).
    ///
    /// Subscriptions do not protect a source. Patterns and subscriptions go
    /// with it through the cascading foreign keys, in the same transaction.
    pub async fn delete_sources_created_before(
        &self,
        cutoff: i64,
    ) -> Result<SweepReport, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let removed: Vec<(i64,)> =
            sqlx::query_as("DELETE FROM sources WHERE created_at < ? RETURNING id")
                .bind(cutoff)
                .fetch_all(&mut *tx)
                .await?;

        tx.commit().await?;

        let mut removed: Vec<i64> = removed.into_iter().map(|(id,)| id).collect();
        removed.sort_unstable();
        Ok(SweepReport { removed, cutoff })
    }
}
