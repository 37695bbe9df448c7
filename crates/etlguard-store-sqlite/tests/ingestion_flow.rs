//! End-to-end ingestion flow over the public API: claim a sync run, land
//! good records, quarantine bad ones, complete with a cursor, then inspect
//! everything through the gate and the audit trail.

use etlguard_core::{
    AuditFilter, Cursor, CursorKind, QuarantineFilter, QuarantineInput, SyncStatus,
};
use etlguard_store_sqlite::{QueryContext, SqliteWarehouse, StoreError};

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("unexpected error: {err}"),
    }
}

fn bad_record(source_id: &str) -> QuarantineInput {
    QuarantineInput {
        batch_id: None,
        source: "hris".to_owned(),
        source_table: Some("employees".to_owned()),
        source_id: Some(source_id.to_owned()),
        raw_data: serde_json::json!({"id": source_id, "email": "broken"}),
        error_reason: "email failed validation".to_owned(),
        error_code: Some("VALIDATION".to_owned()),
        validation_rules_failed: vec!["email_format".to_owned()],
        max_retries: None,
    }
}

#[test]
fn batch_with_failures_lands_clean_records_and_quarantines_the_rest() {
    let mut store = must(SqliteWarehouse::open_in_memory());

    let state = must(store.acquire("hris", "employees"));
    assert_eq!(state.sync_status, SyncStatus::Running);

    // 10-record batch: 8 valid, 2 invalid
    for n in 0..8 {
        must(store.upsert_source_record(
            "hris",
            &format!("emp-{n}"),
            "employees",
            &serde_json::json!({"id": n, "email": format!("user{n}@example.com")}),
        ));
    }
    let quarantined = must(store.quarantine_batch(&[bad_record("emp-8"), bad_record("emp-9")]));
    assert_eq!(quarantined.len(), 2);

    let cursor = Cursor {
        value: "2026-08-30T00:00:00Z".to_owned(),
        kind: CursorKind::HighWaterMark,
    };
    must(store.complete("hris", "employees", 8, Some(&cursor)));

    let state = must(store.get_state("hris", "employees"));
    assert_eq!(state.sync_status, SyncStatus::Completed);
    assert_eq!(state.records_synced, 8);
    assert_eq!(must(store.get_cursor("hris", "employees")), Some(cursor));

    let (_, total) = must(store.list_quarantined(&QuarantineFilter::default()));
    assert_eq!(total, 2);

    let row = must(store.execute_query_one(
        "SELECT COUNT(*) AS landed FROM warehouse_records WHERE source = 'hris'",
    ));
    assert_eq!(
        row.and_then(|r| r.get("landed").cloned()),
        Some(serde_json::json!(8))
    );
}

#[test]
fn replaying_a_batch_does_not_duplicate_records() {
    let mut store = must(SqliteWarehouse::open_in_memory());
    for run in 0..2 {
        must(store.acquire("crm", "accounts"));
        for n in 0..4 {
            must(store.upsert_source_record(
                "crm",
                &format!("acct-{n}"),
                "accounts",
                &serde_json::json!({"id": n, "run": run}),
            ));
        }
        must(store.complete("crm", "accounts", if run == 0 { 4 } else { 0 }, None));
    }
    let row = must(store.execute_query_one(
        "SELECT COUNT(*) AS landed FROM warehouse_records WHERE source = 'crm'",
    ));
    assert_eq!(
        row.and_then(|r| r.get("landed").cloned()),
        Some(serde_json::json!(4))
    );
}

#[test]
fn crashed_run_is_visible_and_recoverable() {
    let mut store = must(SqliteWarehouse::open_in_memory());
    must(store.acquire("hris", "employees"));

    // a second worker cannot claim the pair mid-run
    let err = match store.acquire("hris", "employees") {
        Ok(_) => panic!("expected overlapping claim to fail"),
        Err(err) => err,
    };
    assert!(matches!(err, StoreError::SyncInProgress { .. }));

    // nothing is stale yet; a negative threshold moves the cutoff into the
    // future and flags the running pair
    assert!(must(store.list_stale(time::Duration::hours(1))).is_empty());
    let stale = must(store.list_stale(time::Duration::seconds(-5)));
    assert_eq!(stale.len(), 1);

    // operator marks it failed, then the pair can be claimed again
    must(store.fail("hris", "employees", "worker crashed"));
    must(store.acquire("hris", "employees"));
}

#[test]
fn gated_queries_leave_an_audit_trail_per_caller() {
    let store = must(SqliteWarehouse::open_in_memory());
    let analyst = QueryContext::new("analyst-1", "acme");

    must(store.execute_query_audited("SELECT 1 AS probe", &analyst));
    let rejected = store.execute_query_audited("DELETE FROM warehouse_records", &analyst);
    assert!(rejected.is_err());

    let (entries, total) = must(store.audit_for_actor("analyst-1", &AuditFilter::default()));
    assert_eq!(total, 2);
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.status == etlguard_core::AuditOutcome::Failure));
    assert!(entries.iter().all(|e| e.tenant_id == "acme"));
}
