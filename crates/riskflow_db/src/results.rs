//! Status entries, values and failures written by batch execution.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::BatchDb;
use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use std::collections::HashSet;
use tracing::{debug, info};

impl BatchDb {
    // ========================================================================
    // Writes
    // ========================================================================

    /// Commit everything produced by one executed unit in a single transaction.
    ///
    /// Fails with [`DbError::InvalidState`] when the run does not exist; nothing
    /// from the batch is visible in that case.
    pub async fn write_result_batch(&self, batch: &ResultBatch) -> Result<BatchWriteSummary> {
        if batch.is_empty() {
            debug!(run_id = batch.run_id, "Nothing to write");
            return Ok(BatchWriteSummary::default());
        }

        let mut tx = self.pool.begin().await?;
        ensure_run_exists(&mut tx, batch.run_id).await?;

        let eval_instant = Self::now_millis();
        let mut summary = BatchWriteSummary::default();

        let mut seen = HashSet::new();
        for failure in &batch.compute_failures {
            let hash = failure.content_hash();
            if !seen.insert(hash.clone()) {
                continue;
            }
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO rsk_compute_failure
                    (content_hash, function_id, exception_class, exception_msg, stack_trace)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&hash)
            .bind(&failure.function_id)
            .bind(&failure.exception_class)
            .bind(&failure.exception_msg)
            .bind(&failure.stack_trace)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            summary.compute_failures += inserted;
        }

        for row in &batch.values {
            sqlx::query(
                r#"
                INSERT INTO rsk_value (run_id, calc_conf, value_name, properties, target, value, eval_instant)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(run_id, calc_conf, value_name, properties, target)
                DO UPDATE SET value = excluded.value, eval_instant = excluded.eval_instant
                "#,
            )
            .bind(batch.run_id)
            .bind(&row.key.calc_conf)
            .bind(&row.key.value_name)
            .bind(&row.key.properties)
            .bind(&row.key.target)
            .bind(row.value)
            .bind(eval_instant)
            .execute(&mut *tx)
            .await?;
            summary.values += 1;
        }

        for row in &batch.failures {
            let failure_id = sqlx::query(
                r#"
                INSERT INTO rsk_failure (run_id, calc_conf, value_name, properties, target, eval_instant)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(batch.run_id)
            .bind(&row.key.calc_conf)
            .bind(&row.key.value_name)
            .bind(&row.key.properties)
            .bind(&row.key.target)
            .bind(eval_instant)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
            summary.failures += 1;

            let mut linked_hashes = HashSet::new();
            for hash in &row.reasons {
                if !linked_hashes.insert(hash) {
                    continue;
                }
                let linked = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO rsk_failure_reason (failure_id, compute_failure_id)
                    SELECT ?, id FROM rsk_compute_failure WHERE content_hash = ?
                    "#,
                )
                .bind(failure_id)
                .bind(hash)
                .execute(&mut *tx)
                .await?
                .rows_affected();
                if linked == 0 {
                    return Err(DbError::constraint(format!(
                        "Failure reason {} is not a known compute failure",
                        hash
                    )));
                }
                summary.failure_reasons += linked;
            }
        }

        summary.statuses = upsert_statuses(&mut tx, batch.run_id, &batch.statuses).await?;

        tx.commit().await?;

        info!(
            run_id = batch.run_id,
            values = summary.values,
            failures = summary.failures,
            reasons = summary.failure_reasons,
            statuses = summary.statuses,
            "Result batch committed"
        );
        Ok(summary)
    }

    /// Upsert status entries on their own (e.g. marking targets RUNNING).
    pub async fn upsert_status_entries(&self, run_id: i64, entries: &[StatusEntry]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        ensure_run_exists(&mut tx, run_id).await?;
        let written = upsert_statuses(&mut tx, run_id, entries).await?;
        tx.commit().await?;
        Ok(written)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Latest status for `(run, calc config, target)`, if any was recorded.
    pub async fn get_status(
        &self,
        run_id: i64,
        calc_conf: &str,
        target: &str,
    ) -> Result<Option<TargetStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM rsk_run_status WHERE run_id = ? AND calc_conf = ? AND target = ?",
        )
        .bind(run_id)
        .bind(calc_conf)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;

        status.map(|s| parse_status(&s)).transpose()
    }

    /// All status entries of a run.
    pub async fn status_entries(&self, run_id: i64) -> Result<Vec<StatusEntry>> {
        let rows = sqlx::query(
            "SELECT calc_conf, target, status FROM rsk_run_status WHERE run_id = ? ORDER BY calc_conf, target",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(StatusEntry {
                    calc_conf: row.get("calc_conf"),
                    target: row.get("target"),
                    status: parse_status(&status)?,
                })
            })
            .collect()
    }

    /// Stored value for an output, if any.
    pub async fn get_value(&self, run_id: i64, key: &ValueKey) -> Result<Option<f64>> {
        let value = sqlx::query_scalar(
            r#"
            SELECT value FROM rsk_value
            WHERE run_id = ? AND calc_conf = ? AND value_name = ? AND properties = ? AND target = ?
            "#,
        )
        .bind(run_id)
        .bind(&key.calc_conf)
        .bind(&key.value_name)
        .bind(&key.properties)
        .bind(&key.target)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    /// Compute-failure hashes linked to the failure rows of one output.
    pub async fn failure_reasons(&self, run_id: i64, key: &ValueKey) -> Result<Vec<String>> {
        let hashes = sqlx::query_scalar(
            r#"
            SELECT DISTINCT cf.content_hash
            FROM rsk_failure f
            JOIN rsk_failure_reason r ON r.failure_id = f.id
            JOIN rsk_compute_failure cf ON cf.id = r.compute_failure_id
            WHERE f.run_id = ? AND f.calc_conf = ? AND f.value_name = ? AND f.properties = ? AND f.target = ?
            ORDER BY cf.content_hash
            "#,
        )
        .bind(run_id)
        .bind(&key.calc_conf)
        .bind(&key.value_name)
        .bind(&key.properties)
        .bind(&key.target)
        .fetch_all(&self.pool)
        .await?;
        Ok(hashes)
    }

    pub async fn count_values(&self, run_id: i64) -> Result<u64> {
        self.count_for_run("rsk_value", run_id).await
    }

    pub async fn count_failures(&self, run_id: i64) -> Result<u64> {
        self.count_for_run("rsk_failure", run_id).await
    }

    pub async fn count_failure_reasons(&self, run_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM rsk_failure_reason r
            JOIN rsk_failure f ON f.id = r.failure_id
            WHERE f.run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    /// Distinct compute failures across all runs.
    pub async fn count_compute_failures(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rsk_compute_failure")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_for_run(&self, table: &str, run_id: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE run_id = ?",
            table
        ))
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

async fn ensure_run_exists(conn: &mut SqliteConnection, run_id: i64) -> Result<()> {
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM rsk_run WHERE id = ?")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(DbError::invalid_state(format!(
            "Run {} does not exist (deleted or never started)",
            run_id
        )));
    }
    Ok(())
}

async fn upsert_statuses(
    conn: &mut SqliteConnection,
    run_id: i64,
    entries: &[StatusEntry],
) -> Result<u64> {
    let now = BatchDb::now_millis();
    let mut written = 0;
    for entry in entries {
        sqlx::query(
            r#"
            INSERT INTO rsk_run_status (run_id, calc_conf, target, status, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(run_id, calc_conf, target)
            DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(&entry.calc_conf)
        .bind(&entry.target)
        .bind(entry.status.as_str())
        .bind(now)
        .execute(&mut *conn)
        .await?;
        written += 1;
    }
    Ok(written)
}

fn parse_status(raw: &str) -> Result<TargetStatus> {
    TargetStatus::parse(raw)
        .ok_or_else(|| DbError::invalid_state(format!("Unknown target status: {}", raw)))
}
