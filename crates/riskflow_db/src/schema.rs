//! Schema creation for all batch tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::BatchDb;
use tracing::info;

impl BatchDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;

        self.create_run_tables().await?;
        self.create_result_tables().await?;

        info!("Batch schema verified");
        Ok(())
    }

    /// Runs, their parameters and calculation configurations.
    async fn create_run_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_run (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                valuation_date TEXT NOT NULL,
                valuation_time TEXT NOT NULL,
                snapshot_ref TEXT,
                create_instant INTEGER NOT NULL,
                start_instant INTEGER NOT NULL,
                end_instant INTEGER,
                num_restarts INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0
            )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_run_slot ON rsk_run(valuation_date, valuation_time)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_run_property (
                run_id INTEGER NOT NULL REFERENCES rsk_run(id) ON DELETE CASCADE,
                property_key TEXT NOT NULL,
                property_value TEXT NOT NULL,
                PRIMARY KEY (run_id, property_key)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_calculation_configuration (
                run_id INTEGER NOT NULL REFERENCES rsk_run(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                PRIMARY KEY (run_id, name)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_run_status (
                run_id INTEGER NOT NULL REFERENCES rsk_run(id) ON DELETE CASCADE,
                calc_conf TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (run_id, calc_conf, target)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Values, failures and the deduplicated failure reasons.
    async fn create_result_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_value (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES rsk_run(id) ON DELETE CASCADE,
                calc_conf TEXT NOT NULL,
                value_name TEXT NOT NULL,
                properties TEXT NOT NULL,
                target TEXT NOT NULL,
                value REAL NOT NULL,
                eval_instant INTEGER NOT NULL,
                UNIQUE(run_id, calc_conf, value_name, properties, target)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_failure (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES rsk_run(id) ON DELETE CASCADE,
                calc_conf TEXT NOT NULL,
                value_name TEXT NOT NULL,
                properties TEXT NOT NULL,
                target TEXT NOT NULL,
                eval_instant INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_compute_failure (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash TEXT NOT NULL UNIQUE,
                function_id TEXT NOT NULL,
                exception_class TEXT NOT NULL,
                exception_msg TEXT NOT NULL,
                stack_trace TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS rsk_failure_reason (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                failure_id INTEGER NOT NULL REFERENCES rsk_failure(id) ON DELETE CASCADE,
                compute_failure_id INTEGER NOT NULL REFERENCES rsk_compute_failure(id),
                UNIQUE(failure_id, compute_failure_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_value_run ON rsk_value(run_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_failure_run ON rsk_failure(run_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_failure_reason_failure ON rsk_failure_reason(failure_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
