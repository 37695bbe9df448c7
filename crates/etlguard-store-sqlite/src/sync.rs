//! Sync state tracker: one row per `(source, entity)` pair recording the
//! incremental cursor and the lifecycle of the current run.

use rusqlite::{params, Connection, Row, TransactionBehavior};
use time::Duration;
use ulid::Ulid;

use etlguard_core::{
    format_rfc3339, now_utc, Cursor, CursorKind, SyncState, SyncStats, SyncStatus,
};

use crate::{
    column_error, fmt_now, parse_json_column, parse_opt_ts_column, parse_ts_column,
    parse_ulid_column, SqliteWarehouse, StoreError,
};

const SYNC_COLUMNS: &str = "state_id, source, entity, cursor_value, cursor_kind, last_sync_at, \
     records_synced, sync_status, error_message, metadata, created_at, updated_at";

impl SqliteWarehouse {
    /// Claims the `(source, entity)` pair for a new sync run.
    ///
    /// Creates the state row on first contact, then flips it to `running` in
    /// the same immediate transaction. If the row is already `running` the
    /// claim fails with [`StoreError::SyncInProgress`] and nothing changes.
    pub fn acquire(&mut self, source: &str, entity: &str) -> Result<SyncState, StoreError> {
        if source.trim().is_empty() || entity.trim().is_empty() {
            return Err(etlguard_core::CoreError::Validation(
                "source and entity are required".to_owned(),
            )
            .into());
        }
        let now = fmt_now()?;
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO etl_state (state_id, source, entity, sync_status, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'idle', '{}', ?4, ?4)",
            params![Ulid::new().to_string(), source, entity, now],
        )?;
        let claimed = tx.execute(
            "UPDATE etl_state
             SET sync_status = 'running', error_message = NULL, updated_at = ?3
             WHERE source = ?1 AND entity = ?2 AND sync_status <> 'running'",
            params![source, entity, now],
        )?;
        if claimed == 0 {
            return Err(StoreError::SyncInProgress {
                sync_source: source.to_owned(),
                entity: entity.to_owned(),
            });
        }
        let state = query_state(&tx, source, entity)?.ok_or_else(|| {
            StoreError::SyncStateNotFound {
                sync_source: source.to_owned(),
                entity: entity.to_owned(),
            }
        })?;
        tx.commit()?;
        tracing::info!(source, entity, "sync run acquired");
        Ok(state)
    }

    /// Marks the current run as completed, advances counters and replaces the
    /// cursor with the caller-supplied value. `records_delta` must be
    /// non-negative.
    pub fn complete(
        &mut self,
        source: &str,
        entity: &str,
        records_delta: i64,
        cursor: Option<&Cursor>,
    ) -> Result<(), StoreError> {
        if records_delta < 0 {
            return Err(etlguard_core::CoreError::Validation(format!(
                "records_delta must be >= 0, got {records_delta}"
            ))
            .into());
        }
        let now = fmt_now()?;
        let changed = self.connection().execute(
            "UPDATE etl_state
             SET sync_status = 'completed',
                 records_synced = records_synced + ?3,
                 last_sync_at = ?4,
                 cursor_value = ?5,
                 cursor_kind = ?6,
                 error_message = NULL,
                 updated_at = ?4
             WHERE source = ?1 AND entity = ?2",
            params![
                source,
                entity,
                records_delta,
                now,
                cursor.map(|c| c.value.as_str()),
                cursor.map(|c| c.kind.as_str()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::SyncStateNotFound {
                sync_source: source.to_owned(),
                entity: entity.to_owned(),
            });
        }
        tracing::info!(source, entity, records_delta, "sync run completed");
        Ok(())
    }

    /// Marks the current run as failed. The cursor is left untouched so the
    /// next run resumes from the last committed position.
    pub fn fail(
        &mut self,
        source: &str,
        entity: &str,
        error_message: &str,
    ) -> Result<(), StoreError> {
        let now = fmt_now()?;
        let changed = self.connection().execute(
            "UPDATE etl_state
             SET sync_status = 'failed', error_message = ?3, updated_at = ?4
             WHERE source = ?1 AND entity = ?2",
            params![source, entity, error_message, now],
        )?;
        if changed == 0 {
            return Err(StoreError::SyncStateNotFound {
                sync_source: source.to_owned(),
                entity: entity.to_owned(),
            });
        }
        tracing::warn!(source, entity, error_message, "sync run failed");
        Ok(())
    }

    /// Operator reset: clears cursor and counters and returns the pair to
    /// `idle` so the next run starts a full re-sync.
    pub fn reset(&mut self, source: &str, entity: &str) -> Result<(), StoreError> {
        let now = fmt_now()?;
        let changed = self.connection().execute(
            "UPDATE etl_state
             SET sync_status = 'idle',
                 cursor_value = NULL,
                 cursor_kind = NULL,
                 records_synced = 0,
                 error_message = NULL,
                 updated_at = ?3
             WHERE source = ?1 AND entity = ?2",
            params![source, entity, now],
        )?;
        if changed == 0 {
            return Err(StoreError::SyncStateNotFound {
                sync_source: source.to_owned(),
                entity: entity.to_owned(),
            });
        }
        tracing::info!(source, entity, "sync state reset");
        Ok(())
    }

    /// Current state for a pair. A pair that has never synced reads back as a
    /// synthesized `idle` state rather than an error.
    pub fn get_state(&self, source: &str, entity: &str) -> Result<SyncState, StoreError> {
        match query_state(self.connection(), source, entity)? {
            Some(state) => Ok(state),
            None => Ok(SyncState::idle(source, entity, now_utc())),
        }
    }

    /// Incremental cursor for a pair, `None` until the first completed run.
    pub fn get_cursor(&self, source: &str, entity: &str) -> Result<Option<Cursor>, StoreError> {
        Ok(self.get_state(source, entity)?.cursor())
    }

    /// All tracked states, optionally narrowed by source and/or status.
    pub fn list_states(
        &self,
        source: Option<&str>,
        status: Option<SyncStatus>,
    ) -> Result<Vec<SyncState>, StoreError> {
        let mut sql = format!("SELECT {SYNC_COLUMNS} FROM etl_state WHERE 1 = 1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(source) = source {
            sql.push_str(" AND source = ?");
            args.push(source.to_owned().into());
        }
        if let Some(status) = status {
            sql.push_str(" AND sync_status = ?");
            args.push(status.as_str().to_owned().into());
        }
        sql.push_str(" ORDER BY source, entity");
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), parse_sync_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Runs stuck in `running` longer than the threshold, typically after a
    /// worker crash. Oldest first.
    pub fn list_stale(&self, running_longer_than: Duration) -> Result<Vec<SyncState>, StoreError> {
        let cutoff = now_utc() - running_longer_than;
        let mut stale = self
            .list_states(None, Some(SyncStatus::Running))?
            .into_iter()
            .filter(|state| state.updated_at < cutoff)
            .collect::<Vec<_>>();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(stale)
    }

    /// Aggregate counters across every tracked pair.
    pub fn sync_stats(&self) -> Result<SyncStats, StoreError> {
        let (total, running, completed, failed, idle, records, last): (
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
            Option<String>,
        ) = self.connection().query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE sync_status = 'running'),
                    COUNT(*) FILTER (WHERE sync_status = 'completed'),
                    COUNT(*) FILTER (WHERE sync_status = 'failed'),
                    COUNT(*) FILTER (WHERE sync_status = 'idle'),
                    COALESCE(SUM(records_synced), 0),
                    MAX(last_sync_at)
             FROM etl_state",
            [],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )?;
        let last_sync_at = last
            .as_deref()
            .map(etlguard_core::parse_rfc3339_utc)
            .transpose()?;
        Ok(SyncStats {
            total_entities: total,
            running_syncs: running,
            completed_syncs: completed,
            failed_syncs: failed,
            idle_syncs: idle,
            total_records: records,
            last_sync_at,
        })
    }

    /// Deletes state rows untouched for longer than the retention window.
    /// Returns the number of rows removed.
    pub fn cleanup_old_states(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = format_rfc3339(now_utc() - older_than)?;
        let removed = self.connection().execute(
            "DELETE FROM etl_state WHERE updated_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!(removed, "pruned stale sync state rows");
        }
        Ok(removed as u64)
    }
}

fn query_state(
    conn: &Connection,
    source: &str,
    entity: &str,
) -> Result<Option<SyncState>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SYNC_COLUMNS} FROM etl_state WHERE source = ?1 AND entity = ?2"
    ))?;
    let mut rows = stmt.query_map(params![source, entity], parse_sync_row)?;
    rows.next().transpose().map_err(StoreError::from)
}

fn parse_sync_row(row: &Row<'_>) -> rusqlite::Result<SyncState> {
    let state_id: String = row.get(0)?;
    let cursor_kind: Option<String> = row.get(4)?;
    let last_sync_at: Option<String> = row.get(5)?;
    let status: String = row.get(7)?;
    let metadata: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(SyncState {
        state_id: parse_ulid_column(0, &state_id)?,
        source: row.get(1)?,
        entity: row.get(2)?,
        cursor_value: row.get(3)?,
        cursor_kind: cursor_kind
            .map(|kind| {
                CursorKind::parse(&kind)
                    .ok_or_else(|| column_error(4, format!("unknown cursor kind '{kind}'")))
            })
            .transpose()?,
        last_sync_at: parse_opt_ts_column(5, last_sync_at.as_deref())?,
        records_synced: row.get(6)?,
        sync_status: SyncStatus::parse(&status)
            .ok_or_else(|| column_error(7, format!("unknown sync status '{status}'")))?,
        error_message: row.get(8)?,
        metadata: parse_json_column(9, &metadata)?,
        created_at: parse_ts_column(10, &created_at)?,
        updated_at: parse_ts_column(11, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixture_store, must, must_err};

    fn cursor(value: &str) -> Cursor {
        Cursor {
            value: value.to_owned(),
            kind: CursorKind::HighWaterMark,
        }
    }

    #[test]
    fn acquire_creates_row_and_flips_to_running() {
        let mut store = fixture_store();
        let state = must(store.acquire("hris", "employees"));
        assert_eq!(state.sync_status, SyncStatus::Running);
        assert_eq!(state.records_synced, 0);
        assert!(state.cursor().is_none());
    }

    #[test]
    fn second_acquire_fails_while_running() {
        let mut store = fixture_store();
        must(store.acquire("hris", "employees"));
        let err = must_err(store.acquire("hris", "employees"));
        assert!(matches!(err, StoreError::SyncInProgress { .. }));
        // the pair on a different entity is unaffected
        must(store.acquire("hris", "departments"));
    }

    #[test]
    fn complete_advances_counters_and_cursor() {
        let mut store = fixture_store();
        must(store.acquire("hris", "employees"));
        must(store.complete("hris", "employees", 42, Some(&cursor("2026-05-01T00:00:00Z"))));
        let state = must(store.get_state("hris", "employees"));
        assert_eq!(state.sync_status, SyncStatus::Completed);
        assert_eq!(state.records_synced, 42);
        assert!(state.last_sync_at.is_some());
        let got = must(store.get_cursor("hris", "employees"));
        assert_eq!(got, Some(cursor("2026-05-01T00:00:00Z")));
    }

    #[test]
    fn acquire_after_complete_succeeds_and_counters_accumulate() {
        let mut store = fixture_store();
        must(store.acquire("hris", "employees"));
        must(store.complete("hris", "employees", 10, Some(&cursor("a"))));
        must(store.acquire("hris", "employees"));
        must(store.complete("hris", "employees", 5, Some(&cursor("b"))));
        let state = must(store.get_state("hris", "employees"));
        assert_eq!(state.records_synced, 15);
        assert_eq!(state.cursor_value.as_deref(), Some("b"));
    }

    #[test]
    fn fail_records_error_and_preserves_cursor() {
        let mut store = fixture_store();
        must(store.acquire("crm", "accounts"));
        must(store.complete("crm", "accounts", 3, Some(&cursor("mark-1"))));
        must(store.acquire("crm", "accounts"));
        must(store.fail("crm", "accounts", "upstream timeout"));
        must(store.fail("crm", "accounts", "still down"));
        let state = must(store.get_state("crm", "accounts"));
        assert_eq!(state.sync_status, SyncStatus::Failed);
        assert_eq!(state.error_message.as_deref(), Some("still down"));
        assert_eq!(state.cursor_value.as_deref(), Some("mark-1"));
        // a failed pair can be re-acquired, and the error clears
        let reacquired = must(store.acquire("crm", "accounts"));
        assert_eq!(reacquired.error_message, None);
    }

    #[test]
    fn reset_clears_cursor_and_counters() {
        let mut store = fixture_store();
        must(store.acquire("crm", "accounts"));
        must(store.complete("crm", "accounts", 9, Some(&cursor("mark-9"))));
        must(store.reset("crm", "accounts"));
        let state = must(store.get_state("crm", "accounts"));
        assert_eq!(state.sync_status, SyncStatus::Idle);
        assert_eq!(state.records_synced, 0);
        assert!(state.cursor().is_none());
    }

    #[test]
    fn unknown_pair_reads_back_as_synthesized_idle() {
        let store = fixture_store();
        let state = must(store.get_state("nope", "nothing"));
        assert_eq!(state.sync_status, SyncStatus::Idle);
        assert_eq!(state.records_synced, 0);
        let count: i64 = must(store.connection().query_row(
            "SELECT COUNT(*) FROM etl_state",
            [],
            |row| row.get(0),
        ));
        assert_eq!(count, 0);
    }

    #[test]
    fn lifecycle_writes_against_unknown_pair_error() {
        let mut store = fixture_store();
        let err = must_err(store.complete("nope", "nothing", 1, None));
        assert!(matches!(err, StoreError::SyncStateNotFound { .. }));
        let err = must_err(store.fail("nope", "nothing", "boom"));
        assert!(matches!(err, StoreError::SyncStateNotFound { .. }));
        let err = must_err(store.reset("nope", "nothing"));
        assert!(matches!(err, StoreError::SyncStateNotFound { .. }));
    }

    #[test]
    fn complete_rejects_negative_delta() {
        let mut store = fixture_store();
        must(store.acquire("hris", "employees"));
        let err = must_err(store.complete("hris", "employees", -1, None));
        assert!(matches!(
            err,
            StoreError::Core(etlguard_core::CoreError::Validation(_))
        ));
        // the run is still claimed and no counters moved
        let state = must(store.get_state("hris", "employees"));
        assert_eq!(state.sync_status, SyncStatus::Running);
        assert_eq!(state.records_synced, 0);
    }

    #[test]
    fn list_states_filters_by_source_and_status() {
        let mut store = fixture_store();
        must(store.acquire("hris", "employees"));
        must(store.acquire("crm", "accounts"));
        must(store.complete("crm", "accounts", 1, None));
        let all = must(store.list_states(None, None));
        assert_eq!(all.len(), 2);
        let running = must(store.list_states(None, Some(SyncStatus::Running)));
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].source, "hris");
        let crm = must(store.list_states(Some("crm"), None));
        assert_eq!(crm.len(), 1);
    }

    #[test]
    fn list_stale_flags_long_running_pairs_only() {
        let mut store = fixture_store();
        must(store.acquire("hris", "employees"));
        must(store.acquire("crm", "accounts"));
        // backdate one running row past the threshold
        must(store.connection().execute(
            "UPDATE etl_state SET updated_at = '2020-01-01T00:00:00Z' WHERE source = 'hris'",
            [],
        ));
        let stale = must(store.list_stale(Duration::hours(2)));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].source, "hris");
        let none = must(store.list_stale(Duration::days(36500)));
        assert!(none.is_empty());
    }

    #[test]
    fn sync_stats_counts_by_status() {
        let mut store = fixture_store();
        must(store.acquire("a", "x"));
        must(store.complete("a", "x", 7, None));
        must(store.acquire("b", "y"));
        must(store.fail("b", "y", "bad"));
        must(store.acquire("c", "z"));
        let stats = must(store.sync_stats());
        assert_eq!(stats.total_entities, 3);
        assert_eq!(stats.completed_syncs, 1);
        assert_eq!(stats.failed_syncs, 1);
        assert_eq!(stats.running_syncs, 1);
        assert_eq!(stats.total_records, 7);
        assert!(stats.last_sync_at.is_some());
    }

    #[test]
    fn cleanup_removes_only_rows_past_retention() {
        let mut store = fixture_store();
        must(store.acquire("old", "x"));
        must(store.complete("old", "x", 1, None));
        must(store.acquire("new", "y"));
        must(store.connection().execute(
            "UPDATE etl_state SET updated_at = '2019-01-01T00:00:00Z' WHERE source = 'old'",
            [],
        ));
        let removed = must(store.cleanup_old_states(Duration::days(90)));
        assert_eq!(removed, 1);
        let remaining = must(store.list_states(None, None));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].source, "new");
    }
}
