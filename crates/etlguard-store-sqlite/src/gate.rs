//! Read-only query gate: the only path through which ad-hoc SQL reaches the
//! warehouse. Candidates are validated first, then executed with
//! `PRAGMA query_only` engaged so a statement that slips past validation
//! still cannot write, and every call leaves exactly one audit row.

use std::time::Instant;

use serde_json::Value;

use etlguard_core::gate::{truncate_sql, validate_read_only, AUDIT_SQL_MAX_LEN};
use etlguard_core::{AuditAction, AuditLogInput, AuditOutcome};

use crate::{SqliteWarehouse, StoreError};

/// Actor recorded when a gate call carries no explicit context.
pub const GATE_ACTOR: &str = "query_gate";
/// Tenant recorded for service-internal gate calls.
pub const GATE_TENANT: &str = "system";

/// One result row, columns in SELECT order.
pub type QueryRow = serde_json::Map<String, Value>;

/// Attribution attached to each gated query's audit entry.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub actor_id: String,
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub agent: Option<String>,
    pub request_id: Option<String>,
}

impl QueryContext {
    #[must_use]
    pub fn new(actor_id: &str, tenant_id: &str) -> Self {
        Self {
            actor_id: actor_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            session_id: None,
            agent: None,
            request_id: None,
        }
    }

    /// Context for calls made by the service itself.
    #[must_use]
    pub fn service() -> Self {
        Self::new(GATE_ACTOR, GATE_TENANT)
    }
}

impl SqliteWarehouse {
    /// Runs a gated read attributed to the service itself.
    pub fn execute_query(&self, sql: &str) -> Result<Vec<QueryRow>, StoreError> {
        self.execute_query_audited(sql, &QueryContext::service())
    }

    /// Runs a gated read and returns at most the first row.
    pub fn execute_query_one(&self, sql: &str) -> Result<Option<QueryRow>, StoreError> {
        let rows = self.run_gated(sql, &QueryContext::service(), Some(1))?;
        Ok(rows.into_iter().next())
    }

    /// Runs a gated read attributed to `ctx`.
    ///
    /// Rejected and failed queries are audited the same as successful ones;
    /// the audit row is the record that the attempt happened at all.
    pub fn execute_query_audited(
        &self,
        sql: &str,
        ctx: &QueryContext,
    ) -> Result<Vec<QueryRow>, StoreError> {
        self.run_gated(sql, ctx, None)
    }

    fn run_gated(
        &self,
        sql: &str,
        ctx: &QueryContext,
        max_rows: Option<usize>,
    ) -> Result<Vec<QueryRow>, StoreError> {
        let started = Instant::now();
        if let Err(err) = validate_read_only(sql) {
            tracing::warn!(actor = %ctx.actor_id, error = %err, "query rejected by gate");
            self.audit_query(sql, ctx, AuditOutcome::Failure, Some(&err.to_string()), None, started)?;
            return Err(err.into());
        }
        let outcome = self.run_read_only(sql, max_rows);
        match outcome {
            Ok(rows) => {
                self.audit_query(sql, ctx, AuditOutcome::Success, None, Some(rows.len()), started)?;
                Ok(rows)
            }
            Err(err) => {
                tracing::warn!(actor = %ctx.actor_id, error = %err, "gated query failed");
                self.audit_query(sql, ctx, AuditOutcome::Failure, Some(&err.to_string()), None, started)?;
                Err(err)
            }
        }
    }

    /// Executes under `PRAGMA query_only` and restores the pragma before
    /// returning so the audit insert that follows can proceed.
    fn run_read_only(
        &self,
        sql: &str,
        max_rows: Option<usize>,
    ) -> Result<Vec<QueryRow>, StoreError> {
        self.connection().pragma_update(None, "query_only", true)?;
        let outcome = self.collect_query_rows(sql, max_rows);
        let restored = self.connection().pragma_update(None, "query_only", false);
        let rows = outcome?;
        restored?;
        Ok(rows)
    }

    fn collect_query_rows(
        &self,
        sql: &str,
        max_rows: Option<usize>,
    ) -> Result<Vec<QueryRow>, StoreError> {
        let mut stmt = self.connection().prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = QueryRow::new();
            for (idx, name) in columns.iter().enumerate() {
                record.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
            }
            out.push(record);
            if max_rows.is_some_and(|max| out.len() >= max) {
                break;
            }
        }
        Ok(out)
    }

    fn audit_query(
        &self,
        sql: &str,
        ctx: &QueryContext,
        status: AuditOutcome,
        error: Option<&str>,
        row_count: Option<usize>,
        started: Instant,
    ) -> Result<(), StoreError> {
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis().min(u128::from(u32::MAX)) as i64;
        let mut details = serde_json::Map::new();
        details.insert(
            "sql".to_owned(),
            Value::String(truncate_sql(sql, AUDIT_SQL_MAX_LEN)),
        );
        details.insert("sql_length".to_owned(), Value::from(sql.len()));
        if let Some(count) = row_count {
            details.insert("row_count".to_owned(), Value::from(count));
        }
        if let Some(agent) = &ctx.agent {
            details.insert("agent".to_owned(), Value::String(agent.clone()));
        }
        let mut input = AuditLogInput::new(&ctx.actor_id, &ctx.tenant_id, AuditAction::SqlExecute, status);
        input.session_id = ctx.session_id.clone();
        input.resource_type = Some("warehouse_query".to_owned());
        input.request_id = ctx.request_id.clone();
        input.details = Value::Object(details);
        input.error_message = error.map(str::to_owned);
        input.duration_ms = Some(duration_ms);
        self.record_audit(&input)?;
        Ok(())
    }
}

fn value_ref_to_json(value: rusqlite::types::ValueRef<'_>) -> Value {
    match value {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(n) => Value::from(n),
        rusqlite::types::ValueRef::Real(f) => {
            serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
        }
        rusqlite::types::ValueRef::Text(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        rusqlite::types::ValueRef::Blob(bytes) => {
            Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect())
        }
    }
}
