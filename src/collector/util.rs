use sqlx::error::DatabaseError;

/// `pg_stat_statements` is absent, or installed without being preloaded.
pub fn is_missing_pg_stat_statements(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_err) => {
            is_missing_relation(db_err.as_ref()) || is_not_preloaded(db_err.as_ref())
        }
        _ => false,
    }
}

pub fn is_missing_relation(error: &dyn DatabaseError) -> bool {
    if let Some(code) = error.code() {
        code == "42P01" || code == "42704"
    } else {
        false
    }
}

fn is_not_preloaded(error: &dyn DatabaseError) -> bool {
    error.code().is_some_and(|code| code == "55000")
}

/// Trimmed SQL text, or nothing when redaction is on.
pub fn normalize_query(value: Option<String>, redact: bool) -> Option<String> {
    if redact {
        None
    } else {
        value
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_query_redacts_and_trims() {
        assert_eq!(normalize_query(Some("  select 1 ".into()), true), None);
        assert_eq!(
            normalize_query(Some("  select 1 ".into()), false).as_deref(),
            Some("select 1")
        );
        assert_eq!(normalize_query(Some("   ".into()), false), None);
    }

    #[test]
    fn non_database_errors_are_not_missing_extension() {
        assert!(!is_missing_pg_stat_statements(&sqlx::Error::PoolTimedOut));
    }
}
