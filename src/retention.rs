//! Age-based eviction of registered sources.
//!
//! A source is evicted once it is older than the retention window, whether or
//! not anyone is subscribed to it. Subscribing does not extend a source's
//! life; operators who need longer-lived sources must raise
//! `retention_days`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::storage::{Database, DatabaseError, SweepReport};

/// Result of asking the sweeper to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was already running in this process
    Skipped,
}

/// Deletes sources older than a fixed window. At most one sweep runs at a
/// time per sweeper.
pub struct RetentionSweeper {
    db: Database,
    window: chrono::Duration,
    running: Mutex<()>,
}

impl RetentionSweeper {
    pub fn new(db: Database, window: chrono::Duration) -> Self {
        Self {
            db,
            window,
            running: Mutex::new(()),
        }
    }

    /// Delete every source created before `now - window`.
    ///
    /// Returns [`SweepOutcome::Skipped`] without touching the database if a
    /// sweep is already in progress.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepOutcome, DatabaseError> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("Retention sweep already running, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let cutoff = now
            .checked_sub_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .timestamp();
        let report = self.db.delete_sources_created_before(cutoff).await?;

        if report.removed.is_empty() {
            tracing::debug!(cutoff = cutoff, "Retention sweep removed nothing");
        } else {
            tracing::info!(
                removed = report.removed.len(),
                source_ids = ?report.removed,
                cutoff = cutoff,
                "Retention sweep removed expired sources"
            );
        }
        Ok(SweepOutcome::Completed(report))
    }

    /// Run [`RetentionSweeper::sweep`] every `every`, starting immediately.
    ///
    /// Failures are logged and the loop keeps going. Abort the returned
    /// handle to stop it.
    pub fn spawn_periodic(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep(Utc::now()).await {
                    tracing::warn!(error = %e, "Retention sweep failed");
                }
            }
        })
    }
}
