use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashMap;

use super::schema::Database;
use super::types::{DatabaseError, Source, SourceRow, ValidationError};
use crate::feed::PatternSet;
use crate::util::parse_http_url;

impl Database {
    // ========================================================================
    // Registry Operations
    // ========================================================================

    /// Register a source with its filter patterns, returning the new id.
    ///
    /// The URL must be an `http`/`https` URL and every pattern must compile;
    /// otherwise nothing is written. The source row and its pattern rows are
    /// inserted in one transaction.
    pub async fn register_source<S: AsRef<str>>(
        &self,
        url: &str,
        patterns: &[S],
    ) -> Result<i64, DatabaseError> {
        self.register_source_at(url, patterns, chrono::Utc::now().timestamp())
            .await
    }

    /// [`Database::register_source`] with an explicit creation time.
    pub async fn register_source_at<S: AsRef<str>>(
        &self,
        url: &str,
        patterns: &[S],
        created_at: i64,
    ) -> Result<i64, DatabaseError> {
        let url = parse_http_url(url).map_err(ValidationError::from)?;
        let compiled = PatternSet::compile(patterns).map_err(ValidationError::from)?;

        let mut tx = self.pool.begin().await?;

        let (source_id,): (i64,) =
            sqlx::query_as("INSERT INTO sources (url, created_at) VALUES (?, ?) RETURNING id")
                .bind(url.as_str())
                .bind(created_at)
                .fetch_one(&mut *tx)
                .await?;

        insert_patterns(&mut tx, source_id, compiled.patterns()).await?;

        tx.commit().await?;

        tracing::info!(
            source_id = source_id,
            url = %url,
            patterns = compiled.patterns().len(),
            "Registered source"
        );
        Ok(source_id)
    }

    /// All sources with their patterns, oldest registration first.
    pub async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceRow> =
            sqlx::query_as("SELECT id, url, created_at FROM sources ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await?;
        self.attach_patterns(rows).await
    }

    /// Look up one source by id.
    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>, DatabaseError> {
        let row: Option<SourceRow> =
            sqlx::query_as("SELECT id, url, created_at FROM sources WHERE id = ?")
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(self.attach_patterns(row.into_iter().collect()).await?.pop())
    }

    /// Replace a source's whole pattern list atomically.
    ///
    /// # Errors
    ///
    /// `Validation` if any pattern fails to compile (nothing changes),
    /// `SourceNotFound` for an unknown id.
    pub async fn replace_patterns<S: AsRef<str>>(
        &self,
        source_id: i64,
        patterns: &[S],
    ) -> Result<(), DatabaseError> {
        let compiled = PatternSet::compile(patterns).map_err(ValidationError::from)?;

        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(DatabaseError::SourceNotFound(source_id));
        }

        sqlx::query("DELETE FROM filter_patterns WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;
        insert_patterns(&mut tx, source_id, compiled.patterns()).await?;

        tx.commit().await?;

        tracing::info!(
            source_id = source_id,
            patterns = compiled.patterns().len(),
            "Replaced source patterns"
        );
        Ok(())
    }

    /// Remove a source explicitly. Patterns and subscriptions cascade.
    ///
    /// Returns `false` if no such source existed.
    pub async fn remove_source(&self, source_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            tracing::info!(source_id = source_id, "Removed source");
        }
        Ok(removed)
    }

    /// Resolve pattern lists for a batch of source rows, keeping row order.
    pub(crate) async fn attach_patterns(
        &self,
        rows: Vec<SourceRow>,
    ) -> Result<Vec<Source>, DatabaseError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT source_id, pattern FROM filter_patterns WHERE source_id IN (");
        let mut separated = builder.separated(", ");
        for (id, _, _) in &rows {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let pattern_rows: Vec<(i64, String)> =
            builder.build_query_as().fetch_all(&self.pool).await?;

        let mut by_source: HashMap<i64, Vec<String>> = HashMap::new();
        for (source_id, pattern) in pattern_rows {
            by_source.entry(source_id).or_default().push(pattern);
        }

        Ok(rows
            .into_iter()
            .map(|(id, url, created_at)| Source {
                id,
                url,
                patterns: by_source.remove(&id).unwrap_or_default(),
                created_at,
            })
            .collect())
    }
}

async fn insert_patterns(
    conn: &mut SqliteConnection,
    source_id: i64,
    patterns: &[String],
) -> Result<(), sqlx::Error> {
    if patterns.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO filter_patterns (source_id, pattern) ");
    builder.push_values(patterns, |mut b, pattern| {
        b.push_bind(source_id).push_bind(pattern);
    });
    builder.build().execute(conn).await?;
    Ok(())
}
