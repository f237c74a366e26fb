//! Daily partition tables for extracted items.
//!
//! Items land in `extracted_items_yYYYYmMMdDD` tables. A creator pass
//! materializes the next N days ahead of time; a cleaner drops partitions
//! older than the retention window. Deleting an execution's items is a
//! per-partition delete rather than a partition drop, since partitions mix
//! executions.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::EngineResult;

/// Table name for a given day.
#[must_use]
pub fn partition_name(date: NaiveDate) -> String {
    format!("extracted_items_{}", date.format("y%Ym%md%d"))
}

/// Parse a partition table name back to its date. Returns `None` for tables
/// that are not item partitions.
#[must_use]
pub fn partition_date(table: &str) -> Option<NaiveDate> {
    let suffix = table.strip_prefix("extracted_items_")?;
    NaiveDate::parse_from_str(suffix, "y%Ym%md%d").ok()
}

fn create_partition_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            workflow_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            url TEXT NOT NULL,
            data TEXT NOT NULL,
            extracted_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_{table}_execution ON {table}(execution_id);
        "#
    )
}

/// Materialize partitions for today plus `ahead_days` days.
pub async fn ensure_partitions(pool: &SqlitePool, ahead_days: u32) -> EngineResult<()> {
    let today = Utc::now().date_naive();
    for offset in 0..=i64::from(ahead_days) {
        let date = today + ChronoDuration::days(offset);
        let table = partition_name(date);
        sqlx::query(&create_partition_sql(&table))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// List existing partition tables.
pub async fn list_partitions(pool: &SqlitePool) -> EngineResult<Vec<String>> {
    let rows = sqlx::query(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name LIKE 'extracted_items_y%'",
    )
    .fetch_all(pool)
    .await?;
    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        names.push(row.try_get::<String, _>("name")?);
    }
    names.sort();
    Ok(names)
}

/// Drop partitions whose day is older than the retention window. Returns the
/// number of partitions dropped.
pub async fn drop_expired_partitions(pool: &SqlitePool, retention_days: u32) -> EngineResult<usize> {
    let cutoff = Utc::now().date_naive() - ChronoDuration::days(i64::from(retention_days));
    let mut dropped = 0;
    for table in list_partitions(pool).await? {
        let Some(date) = partition_date(&table) else {
            continue;
        };
        if date < cutoff {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(pool)
                .await?;
            tracing::info!(table, "dropped expired item partition");
            dropped += 1;
        }
    }
    Ok(dropped)
}
