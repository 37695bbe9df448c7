//! Read-only SQL validation for AI-generated queries.
//!
//! The check runs before any statement reaches the warehouse: the
//! leading token must be `SELECT` or `WITH`, and no write/DDL keyword
//! may appear anywhere in the statement (whole-word match, so a DELETE
//! smuggled inside a CTE is still caught). Normalization here is for
//! inspection only; callers execute the original string.

use crate::CoreError;

/// Write, DDL, and administrative keywords that fail validation wherever
/// they appear in a statement.
pub const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "EXEC", "EXECUTE", "CALL", "COPY", "VACUUM", "REINDEX", "CLUSTER", "LOCK", "REFRESH",
    "REASSIGN",
];

/// Maximum statement length copied into audit entries.
pub const AUDIT_SQL_MAX_LEN: usize = 500;

/// Checks that a statement is a pure read.
///
/// # Errors
/// Returns [`CoreError::NotReadOnly`] when the statement does not start
/// with `SELECT` or `WITH`, and [`CoreError::ForbiddenKeyword`] when a
/// write/DDL keyword appears anywhere in it.
pub fn validate_read_only(sql: &str) -> Result<(), CoreError> {
    let leading: String = sql
        .trim_start()
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase();

    if leading != "SELECT" && leading != "WITH" {
        return Err(CoreError::NotReadOnly(truncate_sql(sql, 50)));
    }

    let upper = sql.to_ascii_uppercase();
    for word in upper.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if FORBIDDEN_KEYWORDS.contains(&word) {
            return Err(CoreError::ForbiddenKeyword(word.to_string()));
        }
    }

    Ok(())
}

/// Truncates a statement for audit/log payloads, never full parameter
/// dumps.
#[must_use]
pub fn truncate_sql(sql: &str, max_len: usize) -> String {
    let trimmed = sql.trim();
    if trimmed.chars().count() <= max_len {
        return trimmed.to_string();
    }

    let mut out: String = trimmed.chars().take(max_len).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_reject(sql: &str) -> CoreError {
        match validate_read_only(sql) {
            Ok(()) => panic!("expected rejection for: {sql}"),
            Err(err) => err,
        }
    }

    #[test]
    fn plain_select_passes() {
        assert!(validate_read_only("SELECT 1").is_ok());
    }

    #[test]
    fn lowercase_select_passes() {
        assert!(validate_read_only("select * from x").is_ok());
    }

    #[test]
    fn select_without_forbidden_tokens_passes() {
        assert!(validate_read_only("SELECT name FROM employees").is_ok());
    }

    #[test]
    fn cte_read_passes() {
        assert!(validate_read_only("WITH t AS (SELECT 1 AS n) SELECT n FROM t").is_ok());
    }

    #[test]
    fn update_fails_not_read_only() {
        assert!(matches!(
            must_reject("UPDATE x SET y=1"),
            CoreError::NotReadOnly(_)
        ));
    }

    #[test]
    fn leading_whitespace_does_not_hide_writes() {
        assert!(matches!(
            must_reject("   \n\tINSERT INTO x VALUES (1)"),
            CoreError::NotReadOnly(_)
        ));
    }

    #[test]
    fn delete_inside_cte_is_caught() {
        let err = must_reject("WITH t AS (DELETE FROM x RETURNING *) SELECT * FROM t");
        assert_eq!(err, CoreError::ForbiddenKeyword("DELETE".to_string()));
    }

    #[test]
    fn forbidden_keyword_matches_whole_words_only() {
        // Column and identifier names that merely contain a keyword are fine.
        assert!(validate_read_only("SELECT updated_at, dropped FROM audit_view").is_ok());
        assert!(validate_read_only("SELECT last_update FROM x").is_ok());
    }

    #[test]
    fn empty_statement_fails() {
        assert!(matches!(must_reject(""), CoreError::NotReadOnly(_)));
    }

    #[test]
    fn truncate_appends_ellipsis_only_when_needed() {
        assert_eq!(truncate_sql("SELECT 1", 50), "SELECT 1");
        let long = "SELECT ".repeat(20);
        let truncated = truncate_sql(&long, 10);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.chars().count(), 13);
    }
}
