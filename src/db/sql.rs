// SQL Text Inspection
// Lexical helpers shared by the SQL drivers: limit detection, read/write
// classification and pagination wrapping. Query text is never parsed.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::db::traits::DatabaseType;

fn noise_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"'(?:[^']|'')*'").expect("single-quote pattern"),
            Regex::new(r#""(?:[^"]|"")*""#).expect("double-quote pattern"),
            Regex::new(r"--[^\n]*").expect("line comment pattern"),
            Regex::new(r"(?s)/\*.*?\*/").expect("block comment pattern"),
        ]
    })
}

fn limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\bLIMIT\s+\d+|\bFETCH\s+(?:FIRST|NEXT)\s+\d+|\bSELECT\s+(?:DISTINCT\s+)?TOP\s*\(?\s*\d+",
        )
        .expect("limit pattern")
    })
}

fn order_by_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bORDER\s+BY\b").expect("order by pattern"))
}

/// Remove string literals, quoted identifiers and comments, in that order
pub fn strip_literals_and_comments(sql: &str) -> String {
    noise_patterns()
        .iter()
        .fold(sql.to_string(), |text, re| re.replace_all(&text, " ").into_owned())
}

/// True when the query already bounds its result set with
/// `LIMIT n`, `FETCH FIRST|NEXT n` or `SELECT TOP n` outside literals and comments
pub fn has_limit_clause(sql: &str) -> bool {
    limit_pattern().is_match(&strip_literals_and_comments(sql))
}

/// True when an `ORDER BY` appears outside literals and comments
pub fn has_order_by(sql: &str) -> bool {
    order_by_pattern().is_match(&strip_literals_and_comments(sql))
}

fn leading_keyword(sql: &str) -> String {
    strip_literals_and_comments(sql)
        .split(|c: char| c.is_whitespace() || c == '(')
        .find(|word| !word.is_empty())
        .unwrap_or("")
        .to_uppercase()
}

/// Read queries start with SELECT, WITH or PRAGMA
pub fn is_read_query(sql: &str) -> bool {
    matches!(leading_keyword(sql).as_str(), "SELECT" | "WITH" | "PRAGMA")
}

/// MySQL additionally returns result sets for SHOW, DESCRIBE and EXPLAIN
pub fn is_mysql_read_query(sql: &str) -> bool {
    is_read_query(sql)
        || matches!(
            leading_keyword(sql).as_str(),
            "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN"
        )
}

/// SQL Server procedures return result sets through EXEC
pub fn is_mssql_read_query(sql: &str) -> bool {
    is_read_query(sql) || matches!(leading_keyword(sql).as_str(), "EXEC" | "EXECUTE")
}

/// Only SELECT/WITH statements accept an appended LIMIT
pub fn accepts_pagination(sql: &str) -> bool {
    matches!(leading_keyword(sql).as_str(), "SELECT" | "WITH")
}

/// Trim whitespace and any trailing statement terminators
pub fn normalize_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Outcome of the pagination step
#[derive(Debug, Clone, PartialEq)]
pub struct PagedQuery {
    pub sql: String,
    pub limit_applied: bool,
}

/// Append a page clause to a read query that has none.
///
/// Queries that already carry a limit, non-read statements and calls without
/// a `limit` come back unchanged.
pub fn paginate(engine: DatabaseType, sql: &str, limit: Option<u64>, offset: Option<u64>) -> PagedQuery {
    let sql = normalize_statement(sql);
    let limit = match limit {
        Some(limit) if accepts_pagination(sql) && !has_limit_clause(sql) => limit,
        _ => {
            return PagedQuery {
                sql: sql.to_string(),
                limit_applied: false,
            }
        }
    };

    PagedQuery {
        sql: append_page(engine, sql, limit, offset.unwrap_or(0)),
        limit_applied: true,
    }
}

/// Append the engine's page clause to `sql` unconditionally
pub fn append_page(engine: DatabaseType, sql: &str, limit: u64, offset: u64) -> String {
    let sql = normalize_statement(sql);
    match engine {
        DatabaseType::Mssql => {
            let order = if has_order_by(sql) { "" } else { " ORDER BY (SELECT NULL)" };
            format!("{sql}{order} OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY")
        }
        _ => format!("{sql} LIMIT {limit} OFFSET {offset}"),
    }
}

/// `SELECT COUNT(*)` over the caller's original query, for `total_rows`
pub fn count_query(engine: DatabaseType, sql: &str) -> String {
    let inner = normalize_statement(sql);
    match engine {
        // SQL Server rejects ORDER BY inside derived tables without TOP/OFFSET
        DatabaseType::Mssql => {
            format!("SELECT COUNT(*) FROM ({}) AS _polydb_count", strip_mssql_order_by(inner))
        }
        _ => format!("SELECT COUNT(*) FROM ({inner}) AS _polydb_count"),
    }
}

fn strip_mssql_order_by(sql: &str) -> &str {
    let cleaned = strip_literals_and_comments(sql);
    // Only cut when the last ORDER BY sits at the same byte offset in both texts,
    // i.e. nothing before it was rewritten by the stripping step.
    match (
        order_by_pattern().find_iter(&cleaned).last(),
        order_by_pattern().find_iter(sql).last(),
    ) {
        (Some(a), Some(b)) if a.start() == b.start() && !cleaned[a.end()..].contains(')') => {
            sql[..b.start()].trim_end()
        }
        _ => sql,
    }
}

/// Quote an identifier for the engine's dialect
pub fn quote_ident(engine: DatabaseType, ident: &str) -> String {
    match engine {
        DatabaseType::Mysql => format!("`{}`", ident.replace('`', "``")),
        DatabaseType::Mssql => format!("[{}]", ident.replace(']', "]]")),
        _ => format!("\"{}\"", ident.replace('"', "\"\"")),
    }
}

/// `schema.table` (or just `table`) quoted for the engine
pub fn qualified_name(engine: DatabaseType, table: &str, schema: Option<&str>) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => {
            format!("{}.{}", quote_ident(engine, schema), quote_ident(engine, table))
        }
        _ => quote_ident(engine, table),
    }
}

/// Escape a single-quoted SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a JSON value as a SQL literal for INSERT statements
pub fn value_literal(engine: DatabaseType, value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => match engine {
            DatabaseType::Postgresql => if *b { "TRUE" } else { "FALSE" }.to_string(),
            _ => if *b { "1" } else { "0" }.to_string(),
        },
        Value::Number(n) => n.to_string(),
        Value::String(s) => match engine {
            DatabaseType::Mssql => format!("N{}", quote_literal(s)),
            // Backslash is an escape character in MySQL's default sql_mode
            DatabaseType::Mysql => quote_literal(&s.replace('\\', "\\\\")),
            _ => quote_literal(s),
        },
        other => value_literal(engine, &Value::String(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_inside_literal_is_ignored() {
        assert!(!has_limit_clause("SELECT * FROM t WHERE name = 'LIMIT'"));
        assert!(!has_limit_clause("SELECT * FROM t WHERE name = 'LIMIT 10'"));
        assert!(has_limit_clause("SELECT * FROM t LIMIT 10"));
    }

    #[test]
    fn test_limit_inside_comments_is_ignored() {
        assert!(!has_limit_clause("SELECT * FROM t -- LIMIT 10"));
        assert!(!has_limit_clause("SELECT * FROM t /* LIMIT 10 */"));
        assert!(!has_limit_clause("SELECT \"LIMIT 5\" FROM t"));
        assert!(has_limit_clause("SELECT * FROM t /* c */ limit 3"));
    }

    #[test]
    fn test_fetch_and_top_forms() {
        assert!(has_limit_clause("SELECT * FROM t ORDER BY id OFFSET 0 ROWS FETCH NEXT 5 ROWS ONLY"));
        assert!(has_limit_clause("select * from t fetch first 3 rows only"));
        assert!(has_limit_clause("SELECT TOP 10 * FROM t"));
        assert!(has_limit_clause("SELECT TOP (10) * FROM t"));
        assert!(!has_limit_clause("SELECT top_score FROM t"));
    }

    #[test]
    fn test_append_page_keeps_existing_order() {
        assert_eq!(
            append_page(DatabaseType::Sqlite, "SELECT * FROM t ORDER BY id;", 3, 6),
            "SELECT * FROM t ORDER BY id LIMIT 3 OFFSET 6"
        );
        assert_eq!(
            append_page(DatabaseType::Mssql, "SELECT * FROM t ORDER BY id", 3, 0),
            "SELECT * FROM t ORDER BY id OFFSET 0 ROWS FETCH NEXT 3 ROWS ONLY"
        );
        assert_eq!(
            append_page(DatabaseType::Mssql, "SELECT * FROM t", 3, 0),
            "SELECT * FROM t ORDER BY (SELECT NULL) OFFSET 0 ROWS FETCH NEXT 3 ROWS ONLY"
        );
    }

    #[test]
    fn test_read_classification() {
        assert!(is_read_query("  select 1"));
        assert!(is_read_query("WITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_read_query("PRAGMA table_info('t')"));
        assert!(is_read_query("-- note\nSELECT 1"));
        assert!(!is_read_query("INSERT INTO t VALUES (1)"));
        assert!(is_mysql_read_query("SHOW TABLES"));
        assert!(!is_read_query("SHOW TABLES"));
        assert!(is_mssql_read_query("EXEC sp_who"));
        assert!(!is_mssql_read_query("UPDATE t SET a = 1"));
    }

    #[test]
    fn test_paginate_appends_limit() {
        let paged = paginate(DatabaseType::Sqlite, "SELECT * FROM users;", Some(10), Some(5));
        assert_eq!(paged.sql, "SELECT * FROM users LIMIT 10 OFFSET 5");
        assert!(paged.limit_applied);
    }

    #[test]
    fn test_paginate_is_idempotent_on_existing_limit() {
        let paged = paginate(DatabaseType::Sqlite, "SELECT * FROM users LIMIT 5", Some(10), Some(5));
        assert_eq!(paged.sql, "SELECT * FROM users LIMIT 5");
        assert!(!paged.limit_applied);
    }

    #[test]
    fn test_paginate_skips_writes_and_pragmas() {
        let paged = paginate(DatabaseType::Sqlite, "DELETE FROM users", Some(10), None);
        assert!(!paged.limit_applied);
        let paged = paginate(DatabaseType::Sqlite, "PRAGMA table_info(users)", Some(10), None);
        assert!(!paged.limit_applied);
    }

    #[test]
    fn test_mssql_pagination_injects_order_by() {
        let paged = paginate(DatabaseType::Mssql, "SELECT * FROM users", Some(10), None);
        assert_eq!(
            paged.sql,
            "SELECT * FROM users ORDER BY (SELECT NULL) OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"
        );
        let paged = paginate(DatabaseType::Mssql, "SELECT * FROM users ORDER BY id", Some(10), Some(20));
        assert_eq!(
            paged.sql,
            "SELECT * FROM users ORDER BY id OFFSET 20 ROWS FETCH NEXT 10 ROWS ONLY"
        );
    }

    #[test]
    fn test_count_query_wraps_original() {
        assert_eq!(
            count_query(DatabaseType::Postgresql, "SELECT * FROM t;"),
            "SELECT COUNT(*) FROM (SELECT * FROM t) AS _polydb_count"
        );
        assert_eq!(
            count_query(DatabaseType::Mssql, "SELECT * FROM t ORDER BY id"),
            "SELECT COUNT(*) FROM (SELECT * FROM t) AS _polydb_count"
        );
    }

    #[test]
    fn test_quote_ident_per_dialect() {
        assert_eq!(quote_ident(DatabaseType::Mysql, "a`b"), "`a``b`");
        assert_eq!(quote_ident(DatabaseType::Mssql, "a]b"), "[a]]b]");
        assert_eq!(quote_ident(DatabaseType::Postgresql, "a\"b"), "\"a\"\"b\"");
        assert_eq!(
            qualified_name(DatabaseType::Postgresql, "users", Some("public")),
            "\"public\".\"users\""
        );
    }

    #[test]
    fn test_value_literal() {
        assert_eq!(value_literal(DatabaseType::Sqlite, &Value::Null), "NULL");
        assert_eq!(value_literal(DatabaseType::Postgresql, &Value::Bool(true)), "TRUE");
        assert_eq!(value_literal(DatabaseType::Mysql, &Value::Bool(true)), "1");
        assert_eq!(value_literal(DatabaseType::Sqlite, &serde_json::json!("it's")), "'it''s'");
        assert_eq!(value_literal(DatabaseType::Mssql, &serde_json::json!("x")), "N'x'");
        assert_eq!(value_literal(DatabaseType::Mysql, &serde_json::json!("a\\b")), "'a\\\\b'");
        assert_eq!(value_literal(DatabaseType::Sqlite, &serde_json::json!({"k": 1})), "'{\"k\":1}'");
    }
}
