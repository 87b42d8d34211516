//! Summaries of completed sync runs.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{Store, parse_timestamp, timestamp};
use crate::Result;
use crate::scheduler::RunSummary;

/// One triggered run as recorded in `sync_runs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRecord {
    /// Shard filter of the trigger.
    pub node: Option<i64>,
    /// When the trigger was accepted.
    pub started_at: DateTime<Utc>,
    /// When the last worker of the run finished.
    pub finished_at: DateTime<Utc>,
    /// Counts.
    pub summary: RunSummary,
}

impl Store {
    /// Records a finished run.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        let summary = &run.summary;
        sqlx::query(
            r"
            INSERT INTO sync_runs (
                node, started_at, finished_at, accounts, succeeded, failed, listed, fetched
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(run.node)
        .bind(timestamp(run.started_at))
        .bind(timestamp(run.finished_at))
        .bind(count(summary.accounts))
        .bind(count(summary.succeeded))
        .bind(count(summary.failed))
        .bind(count(summary.listed))
        .bind(count(summary.fetched))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r"
            SELECT node, started_at, finished_at, accounts, succeeded, failed, listed, fetched
            FROM sync_runs
            ORDER BY id DESC
            LIMIT ?
            ",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RunRecord {
                node: row.get("node"),
                started_at: parse_timestamp(row.get("started_at")).unwrap_or_default(),
                finished_at: parse_timestamp(row.get("finished_at")).unwrap_or_default(),
                summary: RunSummary {
                    accounts: row.get::<i64, _>("accounts") as usize,
                    succeeded: row.get::<i64, _>("succeeded") as usize,
                    failed: row.get::<i64, _>("failed") as usize,
                    listed: row.get::<i64, _>("listed") as u64,
                    fetched: row.get::<i64, _>("fetched") as u64,
                },
            })
            .collect())
    }
}

fn count<T: TryInto<i64>>(n: T) -> i64 {
    n.try_into().unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_record_and_read_runs() {
        let store = Store::in_memory().await.unwrap();
        let started = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        for i in 0..3 {
            store
                .record_run(&RunRecord {
                    node: if i == 0 { None } else { Some(i) },
                    started_at: started,
                    finished_at: started + Duration::minutes(i),
                    summary: RunSummary {
                        accounts: 2,
                        succeeded: 1,
                        failed: 1,
                        listed: 10,
                        fetched: 8,
                    },
                })
                .await
                .unwrap();
        }

        let runs = store.recent_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].node, Some(2));
        assert_eq!(runs[0].finished_at, started + Duration::minutes(2));
        assert_eq!(runs[1].summary.fetched, 8);
    }
}
