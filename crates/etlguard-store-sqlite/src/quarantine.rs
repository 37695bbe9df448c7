//! Quarantine store: failed ingestion items preserved verbatim with a
//! bounded retry budget and an operator resolution workflow.

use rusqlite::{params, Connection, Row, TransactionBehavior};
use time::Duration;
use ulid::Ulid;

use etlguard_core::{
    format_rfc3339, now_utc, CoreError, QuarantineFilter, QuarantineInput, QuarantineRecord,
    QuarantineStats, QuarantineStatus,
};

use crate::{
    column_error, fmt_now, parse_json_column, parse_opt_ts_column, parse_ts_column,
    parse_ulid_column, SqliteWarehouse, StoreError,
};

const QUARANTINE_COLUMNS: &str = "record_id, batch_id, source, source_table, source_id, raw_data, \
     error_reason, error_code, validation_rules_failed, retry_count, max_retries, last_retry_at, \
     status, resolved_by, resolved_at, resolution_notes, created_at";

impl SqliteWarehouse {
    /// Captures one failed item. The raw payload is stored byte-for-byte as
    /// submitted so it can be replayed later.
    pub fn quarantine(&self, input: &QuarantineInput) -> Result<QuarantineRecord, StoreError> {
        input.validate()?;
        let now = fmt_now()?;
        insert_quarantine(self.connection(), input, &now)
    }

    /// Captures a whole batch of failures atomically. Either every record
    /// lands or none do.
    pub fn quarantine_batch(
        &mut self,
        inputs: &[QuarantineInput],
    ) -> Result<Vec<QuarantineRecord>, StoreError> {
        for input in inputs {
            input.validate()?;
        }
        let now = fmt_now()?;
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut records = Vec::with_capacity(inputs.len());
        for input in inputs {
            records.push(insert_quarantine(&tx, input, &now)?);
        }
        tx.commit()?;
        tracing::info!(count = records.len(), "quarantined batch");
        Ok(records)
    }

    pub fn get_quarantined(&self, record_id: Ulid) -> Result<QuarantineRecord, StoreError> {
        query_record(self.connection(), record_id)?
            .ok_or_else(|| StoreError::NotFound(format!("quarantine record {record_id}")))
    }

    /// Filtered listing plus the total row count matching the filter
    /// (ignoring limit/offset), newest first.
    pub fn list_quarantined(
        &self,
        filter: &QuarantineFilter,
    ) -> Result<(Vec<QuarantineRecord>, u64), StoreError> {
        let mut clauses = String::from(" WHERE 1 = 1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(source) = &filter.source {
            clauses.push_str(" AND source = ?");
            args.push(source.clone().into());
        }
        if let Some(status) = filter.status {
            clauses.push_str(" AND status = ?");
            args.push(status.as_str().to_owned().into());
        }
        if let Some(batch_id) = filter.batch_id {
            clauses.push_str(" AND batch_id = ?");
            args.push(batch_id.to_string().into());
        }
        if let Some(error_code) = &filter.error_code {
            clauses.push_str(" AND error_code = ?");
            args.push(error_code.clone().into());
        }
        if let Some(older_than) = filter.older_than {
            clauses.push_str(" AND created_at < ?");
            args.push(format_rfc3339(older_than)?.into());
        }

        let total: i64 = self.connection().query_row(
            &format!("SELECT COUNT(*) FROM etl_quarantine{clauses}"),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut sql =
            format!("SELECT {QUARANTINE_COLUMNS} FROM etl_quarantine{clauses} ORDER BY created_at DESC, record_id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), parse_quarantine_row)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((records, total.max(0) as u64))
    }

    /// Records one retry attempt against the budget.
    ///
    /// While attempts remain the record moves to `retrying`. The attempt
    /// that lands on the budget cap returns the record to `pending`, where
    /// it waits for an operator instead of burning further retries. Once at
    /// the cap, further calls fail with [`StoreError::MaxRetriesExceeded`].
    pub fn increment_retry(&mut self, record_id: Ulid) -> Result<QuarantineRecord, StoreError> {
        let now = fmt_now()?;
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = query_record(&tx, record_id)?
            .ok_or_else(|| StoreError::NotFound(format!("quarantine record {record_id}")))?;
        if record.status.is_terminal() {
            return Err(CoreError::Validation(format!(
                "quarantine record {record_id} is already {}",
                record.status.as_str()
            ))
            .into());
        }
        if record.retry_count >= record.max_retries {
            return Err(StoreError::MaxRetriesExceeded { record_id });
        }
        let next_count = record.retry_count + 1;
        let next_status = if next_count >= record.max_retries {
            QuarantineStatus::Pending
        } else {
            QuarantineStatus::Retrying
        };
        tx.execute(
            "UPDATE etl_quarantine
             SET retry_count = ?2, status = ?3, last_retry_at = ?4
             WHERE record_id = ?1",
            params![
                record_id.to_string(),
                next_count,
                next_status.as_str(),
                now
            ],
        )?;
        let updated = query_record(&tx, record_id)?
            .ok_or_else(|| StoreError::NotFound(format!("quarantine record {record_id}")))?;
        tx.commit()?;
        Ok(updated)
    }

    /// Records with retry budget remaining for the automated sweep, oldest
    /// first so the sweep is fair under backlog.
    pub fn get_retriable(
        &self,
        source: &str,
        limit: u32,
    ) -> Result<Vec<QuarantineRecord>, StoreError> {
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {QUARANTINE_COLUMNS} FROM etl_quarantine
             WHERE source = ?1
               AND status IN ('pending', 'retrying')
               AND retry_count < max_retries
             ORDER BY created_at ASC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![source, limit], parse_quarantine_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Operator marks the record fixed. Terminal; the record leaves every
    /// retry path. Closing an already-closed record is a no-op that keeps
    /// the original resolution.
    pub fn resolve_quarantined(
        &self,
        record_id: Ulid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        self.close_record(record_id, QuarantineStatus::Resolved, resolved_by, notes)
    }

    /// Resolves many records with the same resolution metadata. Returns the
    /// number actually transitioned; already-terminal records are skipped.
    pub fn resolve_quarantined_batch(
        &mut self,
        record_ids: &[Ulid],
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<u64, StoreError> {
        if resolved_by.trim().is_empty() {
            return Err(CoreError::Validation("resolved_by is required".to_owned()).into());
        }
        let now = fmt_now()?;
        let tx = self
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut transitioned = 0_u64;
        for record_id in record_ids {
            let changed = tx.execute(
                "UPDATE etl_quarantine
                 SET status = 'resolved', resolved_by = ?2, resolved_at = ?3, resolution_notes = ?4
                 WHERE record_id = ?1 AND status IN ('pending', 'retrying')",
                params![record_id.to_string(), resolved_by, now, notes],
            )?;
            transitioned += changed as u64;
        }
        tx.commit()?;
        Ok(transitioned)
    }

    /// Operator dismisses the record as not worth fixing. Terminal.
    pub fn dismiss_quarantined(
        &self,
        record_id: Ulid,
        resolved_by: &str,
    ) -> Result<(), StoreError> {
        self.close_record(record_id, QuarantineStatus::Ignored, resolved_by, None)
    }

    /// Operator returns a record to `pending` with a fresh retry budget,
    /// typically after fixing the upstream cause.
    pub fn requeue_quarantined(&self, record_id: Ulid) -> Result<(), StoreError> {
        let changed = self.connection().execute(
            "UPDATE etl_quarantine
             SET status = 'pending', retry_count = 0, last_retry_at = NULL,
                 resolved_by = NULL, resolved_at = NULL, resolution_notes = NULL
             WHERE record_id = ?1",
            params![record_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "quarantine record {record_id}"
            )));
        }
        tracing::info!(%record_id, "quarantine record requeued");
        Ok(())
    }

    pub fn delete_quarantined(&self, record_id: Ulid) -> Result<(), StoreError> {
        let changed = self.connection().execute(
            "DELETE FROM etl_quarantine WHERE record_id = ?1",
            params![record_id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "quarantine record {record_id}"
            )));
        }
        Ok(())
    }

    /// Prunes terminal records past the retention window, measured from
    /// resolution time (falling back to capture time). Returns rows removed.
    pub fn cleanup_quarantine(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = format_rfc3339(now_utc() - older_than)?;
        let removed = self.connection().execute(
            "DELETE FROM etl_quarantine
             WHERE status IN ('resolved', 'ignored')
               AND COALESCE(resolved_at, created_at) < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            tracing::info!(removed, "pruned resolved quarantine records");
        }
        Ok(removed as u64)
    }

    /// Counts by status plus the top error codes, optionally for one source.
    pub fn quarantine_stats(&self, source: Option<&str>) -> Result<QuarantineStats, StoreError> {
        let (total, pending, retrying, resolved, ignored, avg): (
            i64,
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
        ) = self.connection().query_row(
            "SELECT COUNT(*),
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'retrying'),
                    COUNT(*) FILTER (WHERE status = 'resolved'),
                    COUNT(*) FILTER (WHERE status = 'ignored'),
                    AVG(retry_count)
             FROM etl_quarantine
             WHERE (?1 IS NULL OR source = ?1)",
            params![source],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;

        let mut stmt = self.connection().prepare(
            "SELECT error_code, COUNT(*) AS freq
             FROM etl_quarantine
             WHERE error_code IS NOT NULL AND (?1 IS NULL OR source = ?1)
             GROUP BY error_code
             ORDER BY freq DESC
             LIMIT 10",
        )?;
        let rows = stmt.query_map(params![source], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let by_error_code = rows.collect::<rusqlite::Result<_>>()?;

        Ok(QuarantineStats {
            total_records: total,
            pending_records: pending,
            retrying_records: retrying,
            resolved_records: resolved,
            ignored_records: ignored,
            by_error_code,
            average_retry_count: avg.unwrap_or(0.0),
        })
    }

    fn close_record(
        &self,
        record_id: Ulid,
        status: QuarantineStatus,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        if resolved_by.trim().is_empty() {
            return Err(CoreError::Validation("resolved_by is required".to_owned()).into());
        }
        let now = fmt_now()?;
        let changed = self.connection().execute(
            "UPDATE etl_quarantine
             SET status = ?2, resolved_by = ?3, resolved_at = ?4, resolution_notes = ?5
             WHERE record_id = ?1 AND status IN ('pending', 'retrying')",
            params![
                record_id.to_string(),
                status.as_str(),
                resolved_by,
                now,
                notes
            ],
        )?;
        if changed == 0 {
            // already terminal is a no-op; the first resolution stands
            if query_record(self.connection(), record_id)?.is_some() {
                return Ok(());
            }
            return Err(StoreError::NotFound(format!(
                "quarantine record {record_id}"
            )));
        }
        tracing::info!(%record_id, status = status.as_str(), resolved_by, "quarantine record closed");
        Ok(())
    }
}

fn insert_quarantine(
    conn: &Connection,
    input: &QuarantineInput,
    now: &str,
) -> Result<QuarantineRecord, StoreError> {
    let record_id = Ulid::new();
    let raw = serde_json::to_string(&input.raw_data)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let rules = serde_json::to_string(&input.validation_rules_failed)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let max_retries = input
        .max_retries
        .unwrap_or(etlguard_core::DEFAULT_MAX_RETRIES);
    conn.execute(
        "INSERT INTO etl_quarantine (record_id, batch_id, source, source_table, source_id, raw_data,
             error_reason, error_code, validation_rules_failed, max_retries, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11)",
        params![
            record_id.to_string(),
            input.batch_id.map(|id| id.to_string()),
            input.source,
            input.source_table,
            input.source_id,
            raw,
            input.error_reason,
            input.error_code,
            rules,
            max_retries,
            now
        ],
    )?;
    tracing::warn!(
        source = %input.source,
        error_reason = %input.error_reason,
        error_code = input.error_code.as_deref(),
        "record quarantined"
    );
    query_record(conn, record_id)?
        .ok_or_else(|| StoreError::NotFound(format!("quarantine record {record_id}")))
}

fn query_record(
    conn: &Connection,
    record_id: Ulid,
) -> Result<Option<QuarantineRecord>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {QUARANTINE_COLUMNS} FROM etl_quarantine WHERE record_id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![record_id.to_string()], parse_quarantine_row)?;
    rows.next().transpose().map_err(StoreError::from)
}

fn parse_quarantine_row(row: &Row<'_>) -> rusqlite::Result<QuarantineRecord> {
    let record_id: String = row.get(0)?;
    let batch_id: Option<String> = row.get(1)?;
    let raw_data: String = row.get(5)?;
    let rules: String = row.get(8)?;
    let last_retry_at: Option<String> = row.get(11)?;
    let status: String = row.get(12)?;
    let resolved_at: Option<String> = row.get(14)?;
    let created_at: String = row.get(16)?;

    let rules: Vec<String> = serde_json::from_str(&rules)
        .map_err(|err| column_error(8, format!("invalid rule list: {err}")))?;

    Ok(QuarantineRecord {
        record_id: parse_ulid_column(0, &record_id)?,
        batch_id: batch_id
            .map(|id| parse_ulid_column(1, &id))
            .transpose()?,
        source: row.get(2)?,
        source_table: row.get(3)?,
        source_id: row.get(4)?,
        raw_data: parse_json_column(5, &raw_data)?,
        error_reason: row.get(6)?,
        error_code: row.get(7)?,
        validation_rules_failed: rules,
        retry_count: row.get(9)?,
        max_retries: row.get(10)?,
        last_retry_at: parse_opt_ts_column(11, last_retry_at.as_deref())?,
        status: QuarantineStatus::parse(&status)
            .ok_or_else(|| column_error(12, format!("unknown quarantine status '{status}'")))?,
        resolved_by: row.get(13)?,
        resolved_at: parse_opt_ts_column(14, resolved_at.as_deref())?,
        resolution_notes: row.get(15)?,
        created_at: parse_ts_column(16, &created_at)?,
    })
}
