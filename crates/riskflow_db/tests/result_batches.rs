//! Integration tests for result-batch persistence.

use chrono::NaiveDate;
use riskflow_db::{
    BatchDb, BatchRequest, ComputeFailureKey, DbConfig, FailureRow, ResultBatch, RunCreationMode,
    StatusEntry, TargetStatus, ValueKey, ValueRow,
};
use std::collections::BTreeMap;

async fn started_run(db: &BatchDb) -> i64 {
    let request = BatchRequest {
        valuation_date: NaiveDate::from_ymd_opt(2024, 6, 28).unwrap(),
        valuation_time: "LDN_CLOSE".to_string(),
        snapshot_ref: None,
        parameters: BTreeMap::new(),
        calc_configs: vec!["Default".to_string()],
    };
    db.start_batch(&request, RunCreationMode::Auto)
        .await
        .unwrap()
        .run
        .id
}

fn key(value_name: &str, target: &str) -> ValueKey {
    ValueKey {
        calc_conf: "Default".to_string(),
        value_name: value_name.to_string(),
        properties: "{}".to_string(),
        target: target.to_string(),
    }
}

#[tokio::test]
async fn test_mixed_batch_writes_values_failures_and_statuses() {
    let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
    let run_id = started_run(&db).await;

    let boom = ComputeFailureKey::new("PV-fn", "PricingError", "no curve", "at pv()");
    let mut batch = ResultBatch::new(run_id);
    batch.values.push(ValueRow {
        key: key("PV", "POSITION~1"),
        value: 101.5,
    });
    batch.failures.push(FailureRow {
        key: key("PV", "POSITION~2"),
        reasons: vec![boom.content_hash()],
    });
    batch.compute_failures.push(boom.clone());
    batch.statuses = vec![
        StatusEntry::new("Default", "POSITION~1", TargetStatus::Success),
        StatusEntry::new("Default", "POSITION~2", TargetStatus::Failure),
    ];

    let summary = db.write_result_batch(&batch).await.unwrap();
    assert_eq!(summary.values, 1);
    assert_eq!(summary.failures, 1);
    assert_eq!(summary.failure_reasons, 1);
    assert_eq!(summary.compute_failures, 1);
    assert_eq!(summary.statuses, 2);

    assert_eq!(
        db.get_value(run_id, &key("PV", "POSITION~1")).await.unwrap(),
        Some(101.5)
    );
    assert_eq!(
        db.get_status(run_id, "Default", "POSITION~2").await.unwrap(),
        Some(TargetStatus::Failure)
    );
    assert_eq!(
        db.failure_reasons(run_id, &key("PV", "POSITION~2")).await.unwrap(),
        vec![boom.content_hash()]
    );
}

#[tokio::test]
async fn test_compute_failures_are_deduplicated_by_content() {
    let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
    let run_id = started_run(&db).await;
    let boom = ComputeFailureKey::new("PV-fn", "PricingError", "no curve", "at pv()");

    for target in ["POSITION~1", "POSITION~2"] {
        let mut batch = ResultBatch::new(run_id);
        batch.compute_failures.push(boom.clone());
        batch.failures.push(FailureRow {
            key: key("PV", target),
            reasons: vec![boom.content_hash(), boom.content_hash()],
        });
        db.write_result_batch(&batch).await.unwrap();
    }

    assert_eq!(db.count_compute_failures().await.unwrap(), 1);
    assert_eq!(db.count_failures(run_id).await.unwrap(), 2);
    assert_eq!(db.count_failure_reasons(run_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_writing_to_deleted_run_is_invalid_state_and_leaves_nothing() {
    let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
    let run_id = started_run(&db).await;
    assert!(db.delete_run(run_id).await.unwrap());

    let mut batch = ResultBatch::new(run_id);
    batch.values.push(ValueRow {
        key: key("PV", "POSITION~1"),
        value: 1.0,
    });
    let err = db.write_result_batch(&batch).await.unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(db.count_values(run_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_reason_rolls_back_whole_batch() {
    let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
    let run_id = started_run(&db).await;

    let mut batch = ResultBatch::new(run_id);
    batch.values.push(ValueRow {
        key: key("PV", "POSITION~1"),
        value: 1.0,
    });
    batch.failures.push(FailureRow {
        key: key("PV", "POSITION~2"),
        reasons: vec!["0".repeat(64)],
    });

    assert!(db.write_result_batch(&batch).await.is_err());
    assert_eq!(db.count_values(run_id).await.unwrap(), 0);
    assert_eq!(db.count_failures(run_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_restart_clears_failures_but_keeps_values_and_statuses() {
    let db = BatchDb::open(DbConfig::sqlite_memory()).await.unwrap();
    let run_id = started_run(&db).await;
    let boom = ComputeFailureKey::new("fn", "E", "m", "s");

    let mut batch = ResultBatch::new(run_id);
    batch.values.push(ValueRow {
        key: key("PV", "POSITION~1"),
        value: 3.0,
    });
    batch.compute_failures.push(boom.clone());
    batch.failures.push(FailureRow {
        key: key("PV", "POSITION~2"),
        reasons: vec![boom.content_hash()],
    });
    batch.statuses = vec![
        StatusEntry::new("Default", "POSITION~1", TargetStatus::Success),
        StatusEntry::new("Default", "POSITION~2", TargetStatus::Failure),
    ];
    db.write_result_batch(&batch).await.unwrap();

    let request = BatchRequest {
        valuation_date: NaiveDate::from_ymd_opt(2024, 6, 28).unwrap(),
        valuation_time: "LDN_CLOSE".to_string(),
        snapshot_ref: None,
        parameters: BTreeMap::new(),
        calc_configs: vec!["Default".to_string()],
    };
    let restarted = db.start_batch(&request, RunCreationMode::Auto).await.unwrap();
    assert!(restarted.is_restart());

    assert_eq!(db.count_failures(run_id).await.unwrap(), 0);
    assert_eq!(db.count_failure_reasons(run_id).await.unwrap(), 0);
    assert_eq!(db.count_values(run_id).await.unwrap(), 1);
    assert_eq!(db.status_entries(run_id).await.unwrap().len(), 2);
}
