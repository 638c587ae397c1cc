//! Run lifecycle operations (create, restart, end, delete).

use crate::error::{DbError, Result};
use crate::types::*;
use crate::BatchDb;
use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::info;

impl BatchDb {
    // ========================================================================
    // Batch Lifecycle
    // ========================================================================

    /// Start a batch: create a run or restart the existing one, per `mode`.
    pub async fn start_batch(
        &self,
        request: &BatchRequest,
        mode: RunCreationMode,
    ) -> Result<StartedBatch> {
        let mut tx = self.pool.begin().await?;

        let existing = fetch_run_by_slot(&mut tx, request.valuation_date, &request.valuation_time)
            .await?;

        let started = match (mode, existing) {
            (RunCreationMode::Always, _) | (RunCreationMode::Auto, None) => {
                let run = insert_run(&mut tx, request).await?;
                StartedBatch {
                    run,
                    restarted: false,
                }
            }
            (RunCreationMode::Auto, Some(run)) => {
                let stored = fetch_run_parameters(&mut tx, run.id).await?;
                if stored != request.parameters {
                    return Err(DbError::invalid_state(format!(
                        "Run parameters stored in DB differ from new parameters with respect to: {}",
                        parameter_diff(&stored, &request.parameters).join(", ")
                    )));
                }
                let run = restart(&mut tx, run.id).await?;
                StartedBatch {
                    run,
                    restarted: true,
                }
            }
            (RunCreationMode::Never, Some(run)) => {
                let run = restart(&mut tx, run.id).await?;
                StartedBatch {
                    run,
                    restarted: true,
                }
            }
            (RunCreationMode::Never, None) => {
                return Err(DbError::invalid_state(format!(
                    "Cannot find run in database for {} {}",
                    request.valuation_date, request.valuation_time
                )));
            }
        };

        tx.commit().await?;

        info!(
            run_id = started.run.id,
            restarted = started.restarted,
            restarts = started.run.num_restarts,
            "Batch started"
        );
        Ok(started)
    }

    /// Mark a run complete and stamp its end time.
    pub async fn end_batch(&self, run_id: i64) -> Result<Run> {
        let now = Self::now_millis();
        let result = sqlx::query("UPDATE rsk_run SET end_instant = ?, complete = 1 WHERE id = ?")
            .bind(now)
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::invalid_state(format!(
                "Cannot end run {}: run does not exist",
                run_id
            )));
        }

        info!(run_id, "Batch ended");
        self.get_run(run_id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("Run {}", run_id)))
    }

    /// Delete a run and every row keyed by it.
    pub async fn delete_run(&self, run_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        // Reasons reference failures; clear them explicitly so the delete never
        // depends on the connection's foreign-key setting.
        sqlx::query(
            "DELETE FROM rsk_failure_reason WHERE failure_id IN (SELECT id FROM rsk_failure WHERE run_id = ?)",
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;
        for table in [
            "rsk_failure",
            "rsk_value",
            "rsk_run_status",
            "rsk_calculation_configuration",
            "rsk_run_property",
        ] {
            sqlx::query(&format!("DELETE FROM {} WHERE run_id = ?", table))
                .bind(run_id)
                .execute(&mut *tx)
                .await?;
        }
        let deleted = sqlx::query("DELETE FROM rsk_run WHERE id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Get a run by ID
    pub async fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        let row = sqlx::query("SELECT * FROM rsk_run WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_run).transpose()
    }

    /// Find the run for a valuation slot.
    pub async fn find_run(
        &self,
        valuation_date: NaiveDate,
        valuation_time: &str,
    ) -> Result<Option<Run>> {
        let mut conn = self.pool.acquire().await?;
        fetch_run_by_slot(&mut conn, valuation_date, valuation_time).await
    }

    /// Stored parameters of a run.
    pub async fn run_parameters(&self, run_id: i64) -> Result<BTreeMap<String, String>> {
        let mut conn = self.pool.acquire().await?;
        fetch_run_parameters(&mut conn, run_id).await
    }

    /// Calculation configuration names recorded for a run.
    pub async fn run_calc_configs(&self, run_id: i64) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM rsk_calculation_configuration WHERE run_id = ? ORDER BY name",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

async fn fetch_run_by_slot(
    conn: &mut SqliteConnection,
    valuation_date: NaiveDate,
    valuation_time: &str,
) -> Result<Option<Run>> {
    // A slot may hold several runs created with `Always`; the newest wins.
    let row = sqlx::query(
        "SELECT * FROM rsk_run WHERE valuation_date = ? AND valuation_time = ? \
         ORDER BY id DESC LIMIT 1",
    )
    .bind(valuation_date)
    .bind(valuation_time)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_run).transpose()
}

async fn fetch_run(conn: &mut SqliteConnection, run_id: i64) -> Result<Run> {
    let row = sqlx::query("SELECT * FROM rsk_run WHERE id = ?")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DbError::not_found(format!("Run {}", run_id)))?;
    row_to_run(&row)
}

async fn fetch_run_parameters(
    conn: &mut SqliteConnection,
    run_id: i64,
) -> Result<BTreeMap<String, String>> {
    let rows = sqlx::query(
        "SELECT property_key, property_value FROM rsk_run_property WHERE run_id = ?",
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .iter()
        .map(|row| (row.get("property_key"), row.get("property_value")))
        .collect())
}

async fn insert_run(conn: &mut SqliteConnection, request: &BatchRequest) -> Result<Run> {
    let now = BatchDb::now_millis();
    let run_id = sqlx::query(
        r#"
        INSERT INTO rsk_run (valuation_date, valuation_time, snapshot_ref, create_instant, start_instant, num_restarts, complete)
        VALUES (?, ?, ?, ?, ?, 0, 0)
        "#,
    )
    .bind(request.valuation_date)
    .bind(&request.valuation_time)
    .bind(&request.snapshot_ref)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    for (key, value) in &request.parameters {
        sqlx::query(
            "INSERT INTO rsk_run_property (run_id, property_key, property_value) VALUES (?, ?, ?)",
        )
        .bind(run_id)
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }

    for name in &request.calc_configs {
        sqlx::query(
            "INSERT OR IGNORE INTO rsk_calculation_configuration (run_id, name) VALUES (?, ?)",
        )
        .bind(run_id)
        .bind(name)
        .execute(&mut *conn)
        .await?;
    }

    fetch_run(conn, run_id).await
}

/// Bump the restart counter and clear the failures of the previous attempt.
///
/// Values and status entries survive: they drive pruning on the new attempt.
async fn restart(conn: &mut SqliteConnection, run_id: i64) -> Result<Run> {
    let now = BatchDb::now_millis();
    sqlx::query(
        r#"
        UPDATE rsk_run SET
            start_instant = ?,
            num_restarts = num_restarts + 1,
            complete = 0
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        "DELETE FROM rsk_failure_reason WHERE failure_id IN (SELECT id FROM rsk_failure WHERE run_id = ?)",
    )
    .bind(run_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM rsk_failure WHERE run_id = ?")
        .bind(run_id)
        .execute(&mut *conn)
        .await?;

    fetch_run(conn, run_id).await
}

fn row_to_run(row: &SqliteRow) -> Result<Run> {
    let end_instant: Option<i64> = row.try_get("end_instant")?;
    let complete: i64 = row.try_get("complete")?;
    Ok(Run {
        id: row.try_get("id")?,
        valuation_date: row.try_get("valuation_date")?,
        valuation_time: row.try_get("valuation_time")?,
        snapshot_ref: row.try_get("snapshot_ref")?,
        created_at: BatchDb::millis_to_datetime(row.try_get("create_instant")?),
        started_at: BatchDb::millis_to_datetime(row.try_get("start_instant")?),
        ended_at: end_instant.map(BatchDb::millis_to_datetime),
        num_restarts: row.try_get("num_restarts")?,
        complete: complete != 0,
    })
}

fn parameter_diff(
    stored: &BTreeMap<String, String>,
    requested: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut diff = Vec::new();
    for (key, value) in stored {
        if requested.get(key) != Some(value) {
            diff.push(format!("{}={}", key, value));
        }
    }
    for (key, value) in requested {
        if stored.get(key) != Some(value) {
            diff.push(format!("{}={}", key, value));
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbConfig;

    fn request(date: (i32, u32, u32)) -> BatchRequest {
        BatchRequest {
            valuation_date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            valuation_time: "17:00".to_string(),
            snapshot_ref: Some("snap-1".to_string()),
            parameters: BTreeMap::from([("desk".to_string(), "rates".to_string())]),
            calc_configs: vec!["Default".to_string()],
        }
    }

    #[tokio::test]
    async fn test_auto_creates_then_restarts() {
        let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
        let req = request((2024, 3, 1));

        let first = db.start_batch(&req, RunCreationMode::Auto).await.unwrap();
        assert!(!first.is_restart());
        assert_eq!(first.run.num_restarts, 0);
        assert!(!first.run.complete);
        assert_eq!(db.run_calc_configs(first.run.id).await.unwrap(), vec!["Default"]);

        let second = db.start_batch(&req, RunCreationMode::Auto).await.unwrap();
        assert!(second.is_restart());
        assert_eq!(second.run.id, first.run.id);
        assert_eq!(second.run.num_restarts, 1);
        assert_eq!(second.run.created_at, first.run.created_at);
    }

    #[tokio::test]
    async fn test_auto_rejects_changed_parameters() {
        let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
        let req = request((2024, 3, 1));
        db.start_batch(&req, RunCreationMode::Auto).await.unwrap();

        let mut changed = req.clone();
        changed
            .parameters
            .insert("desk".to_string(), "credit".to_string());
        let err = db
            .start_batch(&changed, RunCreationMode::Auto)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
        assert!(err.to_string().contains("desk=credit"));
    }

    #[tokio::test]
    async fn test_always_creates_new_run_for_existing_slot() {
        let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
        let req = request((2024, 3, 2));

        let first = db.start_batch(&req, RunCreationMode::Auto).await.unwrap();
        let second = db.start_batch(&req, RunCreationMode::Always).await.unwrap();
        assert!(!second.is_restart());
        assert_ne!(second.run.id, first.run.id);
        assert_eq!(second.run.num_restarts, 0);

        let found = db
            .find_run(req.valuation_date, &req.valuation_time)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, second.run.id);

        let third = db.start_batch(&req, RunCreationMode::Auto).await.unwrap();
        assert!(third.is_restart());
        assert_eq!(third.run.id, second.run.id);
        assert!(db.get_run(first.run.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_never_requires_existing_run() {
        let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
        let err = db
            .start_batch(&request((2024, 3, 4)), RunCreationMode::Never)
            .await
            .unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[tokio::test]
    async fn test_end_batch_marks_complete() {
        let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
        let started = db
            .start_batch(&request((2024, 3, 5)), RunCreationMode::Auto)
            .await
            .unwrap();

        let ended = db.end_batch(started.run.id).await.unwrap();
        assert!(ended.complete);
        assert!(ended.ended_at.is_some());

        assert!(db.end_batch(9_999).await.unwrap_err().is_invalid_state());
    }

    #[tokio::test]
    async fn test_delete_run_removes_everything() {
        let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
        let started = db
            .start_batch(&request((2024, 3, 6)), RunCreationMode::Auto)
            .await
            .unwrap();
        assert!(db.delete_run(started.run.id).await.unwrap());
        assert!(db.get_run(started.run.id).await.unwrap().is_none());
        assert!(db.run_parameters(started.run.id).await.unwrap().is_empty());
        assert!(!db.delete_run(started.run.id).await.unwrap());
    }
}
