//! Domain types for the warehouse ingestion safety core.
//!
//! This crate carries the pure pieces shared by the store and the CLI:
//! sync/quarantine/audit record types, their status machines, input
//! validation, and the read-only SQL check in [`gate`]. Nothing in here
//! touches a database.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod gate;

/// Default retry budget for quarantined records.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("only SELECT queries are allowed, got: {0}")]
    NotReadOnly(String),
    #[error("forbidden keyword '{0}' detected in query")]
    ForbiddenKeyword(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(Self::Idle),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CursorKind {
    /// Opaque change marker handed back by the source system.
    ChangeMarker,
    /// High-water-mark timestamp (modified-since style sources).
    HighWaterMark,
    /// Plain offset for paginated sources.
    Offset,
}

impl CursorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChangeMarker => "change_marker",
            Self::HighWaterMark => "high_water_mark",
            Self::Offset => "offset",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "change_marker" => Some(Self::ChangeMarker),
            "high_water_mark" => Some(Self::HighWaterMark),
            "offset" => Some(Self::Offset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    Pending,
    Retrying,
    Resolved,
    Ignored,
}

impl QuarantineStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::Ignored => "ignored",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "retrying" => Some(Self::Retrying),
            "resolved" => Some(Self::Resolved),
            "ignored" => Some(Self::Ignored),
            _ => None,
        }
    }

    /// Resolved and ignored are terminal: no automated retry path.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Ignored)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    QuerySubmit,
    SqlExecute,
    QueryError,
    SyncStart,
    SyncComplete,
    SyncFail,
    SyncReset,
    RecordQuarantined,
    QuarantineResolve,
    ApprovalGate,
    DocumentAction,
    DataAccess,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuerySubmit => "query_submit",
            Self::SqlExecute => "sql_execute",
            Self::QueryError => "query_error",
            Self::SyncStart => "sync_start",
            Self::SyncComplete => "sync_complete",
            Self::SyncFail => "sync_fail",
            Self::SyncReset => "sync_reset",
            Self::RecordQuarantined => "record_quarantined",
            Self::QuarantineResolve => "quarantine_resolve",
            Self::ApprovalGate => "approval_gate",
            Self::DocumentAction => "document_action",
            Self::DataAccess => "data_access",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "query_submit" => Some(Self::QuerySubmit),
            "sql_execute" => Some(Self::SqlExecute),
            "query_error" => Some(Self::QueryError),
            "sync_start" => Some(Self::SyncStart),
            "sync_complete" => Some(Self::SyncComplete),
            "sync_fail" => Some(Self::SyncFail),
            "sync_reset" => Some(Self::SyncReset),
            "record_quarantined" => Some(Self::RecordQuarantined),
            "quarantine_resolve" => Some(Self::QuarantineResolve),
            "approval_gate" => Some(Self::ApprovalGate),
            "document_action" => Some(Self::DocumentAction),
            "data_access" => Some(Self::DataAccess),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Pending,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Pending => "pending",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// Resume point for an incremental sync.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Cursor {
    pub value: String,
    pub kind: CursorKind,
}

/// One row per `(source, entity)` pair; the crash-observable sync record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncState {
    pub state_id: Ulid,
    pub source: String,
    pub entity: String,
    pub cursor_value: Option<String>,
    pub cursor_kind: Option<CursorKind>,
    pub last_sync_at: Option<OffsetDateTime>,
    pub records_synced: i64,
    pub sync_status: SyncStatus,
    pub error_message: Option<String>,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SyncState {
    /// Synthesized idle state for a pair that has never synced.
    #[must_use]
    pub fn idle(source: &str, entity: &str, now: OffsetDateTime) -> Self {
        Self {
            state_id: Ulid::new(),
            source: source.to_string(),
            entity: entity.to_string(),
            cursor_value: None,
            cursor_kind: None,
            last_sync_at: None,
            records_synced: 0,
            sync_status: SyncStatus::Idle,
            error_message: None,
            metadata: Value::Object(serde_json::Map::default()),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn cursor(&self) -> Option<Cursor> {
        match (&self.cursor_value, self.cursor_kind) {
            (Some(value), Some(kind)) => Some(Cursor {
                value: value.clone(),
                kind,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStats {
    pub total_entities: i64,
    pub running_syncs: i64,
    pub completed_syncs: i64,
    pub failed_syncs: i64,
    pub idle_syncs: i64,
    pub total_records: i64,
    pub last_sync_at: Option<OffsetDateTime>,
}

/// One failed ingestion item, preserved verbatim for replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineRecord {
    pub record_id: Ulid,
    pub batch_id: Option<Ulid>,
    pub source: String,
    pub source_table: Option<String>,
    pub source_id: Option<String>,
    pub raw_data: Value,
    pub error_reason: String,
    pub error_code: Option<String>,
    pub validation_rules_failed: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<OffsetDateTime>,
    pub status: QuarantineStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<OffsetDateTime>,
    pub resolution_notes: Option<String>,
    pub created_at: OffsetDateTime,
}

impl QuarantineRecord {
    /// Eligible for the automated retry sweep.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !self.status.is_terminal() && self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineInput {
    pub batch_id: Option<Ulid>,
    pub source: String,
    pub source_table: Option<String>,
    pub source_id: Option<String>,
    pub raw_data: Value,
    pub error_reason: String,
    pub error_code: Option<String>,
    pub validation_rules_failed: Vec<String>,
    pub max_retries: Option<u32>,
}

impl QuarantineInput {
    /// Validates a quarantine capture before insert.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when required fields are missing
    /// or the retry budget is zero.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.source.trim().is_empty() {
            return Err(CoreError::Validation(
                "source MUST be provided for every quarantined record".to_string(),
            ));
        }

        if self.error_reason.trim().is_empty() {
            return Err(CoreError::Validation(
                "error_reason MUST be provided for every quarantined record".to_string(),
            ));
        }

        if self.max_retries == Some(0) {
            return Err(CoreError::Validation(
                "max_retries MUST be >= 1 when set".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuarantineFilter {
    pub source: Option<String>,
    pub status: Option<QuarantineStatus>,
    pub batch_id: Option<Ulid>,
    pub error_code: Option<String>,
    pub older_than: Option<OffsetDateTime>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineStats {
    pub total_records: i64,
    pub pending_records: i64,
    pub retrying_records: i64,
    pub resolved_records: i64,
    pub ignored_records: i64,
    pub by_error_code: BTreeMap<String, i64>,
    pub average_retry_count: f64,
}

/// One append-only row per audited action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogEntry {
    pub id: Ulid,
    pub actor_id: String,
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub action: AuditAction,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub status: AuditOutcome,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub details: Value,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditLogInput {
    pub actor_id: String,
    pub tenant_id: String,
    pub session_id: Option<String>,
    pub action: AuditAction,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub status: AuditOutcome,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub details: Value,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
}

impl AuditLogInput {
    #[must_use]
    pub fn new(actor_id: &str, tenant_id: &str, action: AuditAction, status: AuditOutcome) -> Self {
        Self {
            actor_id: actor_id.to_string(),
            tenant_id: tenant_id.to_string(),
            session_id: None,
            action,
            resource_type: None,
            resource_id: None,
            status,
            ip_address: None,
            user_agent: None,
            request_id: None,
            details: Value::Object(serde_json::Map::default()),
            error_message: None,
            duration_ms: None,
        }
    }

    /// Validates the identity fields the audit contract requires.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when actor or tenant is missing.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.actor_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "actor_id MUST be provided for every audit entry".to_string(),
            ));
        }

        if self.tenant_id.trim().is_empty() {
            return Err(CoreError::Validation(
                "tenant_id MUST be provided for every audit entry".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuditFilter {
    pub actions: Vec<AuditAction>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CoreError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, CoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CoreError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`CoreError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, CoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| CoreError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Current UTC time truncated to whole seconds.
///
/// Server-assigned timestamps are stored at second precision so their
/// RFC3339 text is fixed-width and orders lexicographically in SQL.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc().to_offset(UtcOffset::UTC);
    now.replace_nanosecond(0).unwrap_or(now)
}

#[must_use]
pub fn days(count: i64) -> Duration {
    Duration::days(count)
}
