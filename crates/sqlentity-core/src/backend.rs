//! Backend kinds and their dialect capabilities.
//!
//! Dialect differences are data, not subclasses: code that needs to know
//! how a backend writes a placeholder or where its row-limit clause goes
//! asks the capability table and branches on the answer.

use serde::{Deserialize, Serialize};

/// The backend family behind a driver connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    Postgres,
    Mysql,
    Mssql,
    /// The in-process reference store
    Memory,
}

/// Where a backend expects its row-limit clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLimit {
    /// `... LIMIT n` appended to the statement
    LimitSuffix,
    /// `SELECT TOP n ...` embedded after the SELECT keyword
    SelectTop,
}

impl Backend {
    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Backend::Postgres => format!("${index}"),
            Backend::Mysql | Backend::Mssql | Backend::Memory => "?".to_string(),
        }
    }

    /// Quote an identifier for this backend.
    pub fn quote_identifier(&self, name: &str) -> String {
        match self {
            Backend::Postgres | Backend::Memory => format!("\"{}\"", name.replace('"', "\"\"")),
            Backend::Mysql => format!("`{}`", name.replace('`', "``")),
            Backend::Mssql => format!("[{}]", name.replace(']', "]]")),
        }
    }

    /// Row-limit clause placement.
    pub fn row_limit(&self) -> RowLimit {
        match self {
            Backend::Mssql => RowLimit::SelectTop,
            Backend::Postgres | Backend::Mysql | Backend::Memory => RowLimit::LimitSuffix,
        }
    }

    /// Rewrite a SELECT so it returns at most `limit` rows.
    pub fn apply_row_limit(&self, sql: &str, limit: u64) -> String {
        match self.row_limit() {
            RowLimit::LimitSuffix => format!("{sql} LIMIT {limit}"),
            RowLimit::SelectTop => {
                // Embed after the leading SELECT keyword.
                if let Some(rest) = sql.strip_prefix("SELECT ") {
                    format!("SELECT TOP {limit} {rest}")
                } else {
                    sql.to_string()
                }
            }
        }
    }

    /// Trailing clause for a locked read, if the backend uses one.
    pub fn for_update_suffix(&self) -> &'static str {
        match self {
            Backend::Postgres | Backend::Mysql | Backend::Memory => " FOR UPDATE",
            Backend::Mssql => "",
        }
    }

    /// Table hint for a locked read, if the backend uses one instead of
    /// a suffix. Placed directly after the table name.
    pub fn lock_hint(&self) -> &'static str {
        match self {
            Backend::Mssql => " WITH (UPDLOCK, ROWLOCK)",
            Backend::Postgres | Backend::Mysql | Backend::Memory => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders() {
        assert_eq!(Backend::Postgres.placeholder(1), "$1");
        assert_eq!(Backend::Postgres.placeholder(3), "$3");
        assert_eq!(Backend::Mysql.placeholder(1), "?");
        assert_eq!(Backend::Memory.placeholder(7), "?");
    }

    #[test]
    fn identifier_quoting() {
        assert_eq!(Backend::Postgres.quote_identifier("modlog"), "\"modlog\"");
        assert_eq!(Backend::Mysql.quote_identifier("modlog"), "`modlog`");
        assert_eq!(Backend::Mssql.quote_identifier("modlog"), "[modlog]");
    }

    #[test]
    fn row_limit_placement() {
        assert_eq!(
            Backend::Postgres.apply_row_limit("SELECT id FROM t", 5),
            "SELECT id FROM t LIMIT 5"
        );
        assert_eq!(
            Backend::Mssql.apply_row_limit("SELECT id FROM t", 5),
            "SELECT TOP 5 id FROM t"
        );
    }

    #[test]
    fn locked_read_capabilities() {
        assert_eq!(Backend::Postgres.for_update_suffix(), " FOR UPDATE");
        assert_eq!(Backend::Postgres.lock_hint(), "");
        assert_eq!(Backend::Mssql.for_update_suffix(), "");
        assert_eq!(Backend::Mssql.lock_hint(), " WITH (UPDLOCK, ROWLOCK)");
    }
}
