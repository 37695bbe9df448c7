//! Append-only audit trail. Rows are insert-only; schema triggers reject
//! UPDATE and DELETE so history cannot be rewritten through any code path.

use rusqlite::{params, Row};
use ulid::Ulid;

use etlguard_core::{
    format_rfc3339, AuditAction, AuditFilter, AuditLogEntry, AuditLogInput, AuditOutcome,
};

use crate::{
    column_error, fmt_now, parse_json_column, parse_ts_column, parse_ulid_column, SqliteWarehouse,
    StoreError,
};

const AUDIT_COLUMNS: &str = "entry_id, actor_id, tenant_id, session_id, action, resource_type, \
     resource_id, status, ip_address, user_agent, request_id, details, error_message, \
     duration_ms, created_at";

impl SqliteWarehouse {
    /// Appends one audit entry and returns it with its assigned id and
    /// server timestamp.
    pub fn record_audit(&self, input: &AuditLogInput) -> Result<AuditLogEntry, StoreError> {
        input.validate()?;
        let entry_id = Ulid::new();
        let now = fmt_now()?;
        let details = serde_json::to_string(&input.details)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.connection().execute(
            "INSERT INTO audit_logs (entry_id, actor_id, tenant_id, session_id, action,
                 resource_type, resource_id, status, ip_address, user_agent, request_id,
                 details, error_message, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry_id.to_string(),
                input.actor_id,
                input.tenant_id,
                input.session_id,
                input.action.as_str(),
                input.resource_type,
                input.resource_id,
                input.status.as_str(),
                input.ip_address,
                input.user_agent,
                input.request_id,
                details,
                input.error_message,
                input.duration_ms,
                now
            ],
        )?;
        let mut stmt = self.connection().prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE entry_id = ?1"
        ))?;
        let entry = stmt.query_row(params![entry_id.to_string()], parse_audit_row)?;
        Ok(entry)
    }

    /// Entries for one actor, newest first, with the unpaginated total.
    pub fn audit_for_actor(
        &self,
        actor_id: &str,
        filter: &AuditFilter,
    ) -> Result<(Vec<AuditLogEntry>, u64), StoreError> {
        self.list_audit("actor_id", actor_id, filter)
    }

    /// Entries for one tenant, newest first, with the unpaginated total.
    pub fn audit_for_tenant(
        &self,
        tenant_id: &str,
        filter: &AuditFilter,
    ) -> Result<(Vec<AuditLogEntry>, u64), StoreError> {
        self.list_audit("tenant_id", tenant_id, filter)
    }

    fn list_audit(
        &self,
        key_column: &str,
        key: &str,
        filter: &AuditFilter,
    ) -> Result<(Vec<AuditLogEntry>, u64), StoreError> {
        let mut clauses = format!(" WHERE {key_column} = ?");
        let mut args: Vec<rusqlite::types::Value> = vec![key.to_owned().into()];
        if !filter.actions.is_empty() {
            let placeholders = vec!["?"; filter.actions.len()].join(", ");
            clauses.push_str(&format!(" AND action IN ({placeholders})"));
            for action in &filter.actions {
                args.push(action.as_str().to_owned().into());
            }
        }
        if let Some(from) = filter.from {
            clauses.push_str(" AND created_at >= ?");
            args.push(format_rfc3339(from)?.into());
        }
        if let Some(to) = filter.to {
            clauses.push_str(" AND created_at <= ?");
            args.push(format_rfc3339(to)?.into());
        }
        if let Some(resource_type) = &filter.resource_type {
            clauses.push_str(" AND resource_type = ?");
            args.push(resource_type.clone().into());
        }
        if let Some(resource_id) = &filter.resource_id {
            clauses.push_str(" AND resource_id = ?");
            args.push(resource_id.clone().into());
        }

        let total: i64 = self.connection().query_row(
            &format!("SELECT COUNT(*) FROM audit_logs{clauses}"),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let mut sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs{clauses} ORDER BY created_at DESC, entry_id DESC"
        );
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        let mut stmt = self.connection().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args), parse_audit_row)?;
        let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((entries, total.max(0) as u64))
    }
}

fn parse_audit_row(row: &Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    let entry_id: String = row.get(0)?;
    let action: String = row.get(4)?;
    let status: String = row.get(7)?;
    let details: String = row.get(11)?;
    let created_at: String = row.get(14)?;

    Ok(AuditLogEntry {
        id: parse_ulid_column(0, &entry_id)?,
        actor_id: row.get(1)?,
        tenant_id: row.get(2)?,
        session_id: row.get(3)?,
        action: AuditAction::parse(&action)
            .ok_or_else(|| column_error(4, format!("unknown audit action '{action}'")))?,
        resource_type: row.get(5)?,
        resource_id: row.get(6)?,
        status: AuditOutcome::parse(&status)
            .ok_or_else(|| column_error(7, format!("unknown audit status '{status}'")))?,
        ip_address: row.get(8)?,
        user_agent: row.get(9)?,
        request_id: row.get(10)?,
        details: parse_json_column(11, &details)?,
        error_message: row.get(12)?,
        duration_ms: row.get(13)?,
        created_at: parse_ts_column(14, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fixture_store, must, must_err};
    use etlguard_core::CoreError;

    fn entry(actor: &str, tenant: &str, action: AuditAction) -> AuditLogInput {
        AuditLogInput::new(actor, tenant, action, AuditOutcome::Success)
    }

    #[test]
    fn record_assigns_id_and_server_timestamp() {
        let store = fixture_store();
        let mut input = entry("svc-etl", "acme", AuditAction::SyncComplete);
        input.resource_type = Some("etl_state".to_owned());
        input.duration_ms = Some(120);
        let written = must(store.record_audit(&input));
        assert_eq!(written.actor_id, "svc-etl");
        assert_eq!(written.action, AuditAction::SyncComplete);
        assert_eq!(written.duration_ms, Some(120));
    }

    #[test]
    fn record_rejects_blank_actor_or_tenant() {
        let store = fixture_store();
        let err = must_err(store.record_audit(&entry("", "acme", AuditAction::DataAccess)));
        assert!(matches!(err, StoreError::Core(CoreError::Validation(_))));
        let err = must_err(store.record_audit(&entry("svc", " ", AuditAction::DataAccess)));
        assert!(matches!(err, StoreError::Core(CoreError::Validation(_))));
    }

    #[test]
    fn actor_listing_filters_by_action_and_paginates() {
        let store = fixture_store();
        for _ in 0..3 {
            must(store.record_audit(&entry("maria", "acme", AuditAction::SqlExecute)));
        }
        must(store.record_audit(&entry("maria", "acme", AuditAction::SyncReset)));
        must(store.record_audit(&entry("other", "acme", AuditAction::SqlExecute)));

        let all = AuditFilter::default();
        let (entries, total) = must(store.audit_for_actor("maria", &all));
        assert_eq!(entries.len(), 4);
        assert_eq!(total, 4);

        let narrowed = AuditFilter {
            actions: vec![AuditAction::SqlExecute],
            limit: Some(2),
            ..AuditFilter::default()
        };
        let (page, total) = must(store.audit_for_actor("maria", &narrowed));
        assert_eq!(page.len(), 2);
        assert_eq!(total, 3);
    }

    #[test]
    fn tenant_listing_spans_actors() {
        let store = fixture_store();
        must(store.record_audit(&entry("a", "acme", AuditAction::DataAccess)));
        must(store.record_audit(&entry("b", "acme", AuditAction::DataAccess)));
        must(store.record_audit(&entry("c", "globex", AuditAction::DataAccess)));
        let (entries, total) = must(store.audit_for_tenant("acme", &AuditFilter::default()));
        assert_eq!(entries.len(), 2);
        assert_eq!(total, 2);
    }

    #[test]
    fn time_window_filter_bounds_results() {
        let store = fixture_store();
        must(store.record_audit(&entry("maria", "acme", AuditAction::DataAccess)));
        let past_only = AuditFilter {
            to: Some(must(etlguard_core::parse_rfc3339_utc(
                "2000-01-01T00:00:00Z",
            ))),
            ..AuditFilter::default()
        };
        let (entries, total) = must(store.audit_for_actor("maria", &past_only));
        assert!(entries.is_empty());
        assert_eq!(total, 0);

        let open_window = AuditFilter {
            from: Some(must(etlguard_core::parse_rfc3339_utc(
                "2000-01-01T00:00:00Z",
            ))),
            ..AuditFilter::default()
        };
        let (entries, _) = must(store.audit_for_actor("maria", &open_window));
        assert_eq!(entries.len(), 1);
    }
}
