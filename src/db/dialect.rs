//! Per-dialect SQL text.
//!
//! Statement builders are pure functions so they can be unit tested without
//! a server. Catalog queries live in the `queries` submodule, one constant
//! per dialect.

use crate::error::{HarnessError, HarnessResult};
use crate::models::BackendKind;

/// Check that `name` is a plain (optionally schema-qualified) identifier.
///
/// Table, column and savepoint names are interpolated into statement text,
/// so anything else is rejected.
pub fn validate_identifier(name: &str) -> HarnessResult<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(HarnessError::invalid_input(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

/// Quote an identifier for the dialect, segment by segment.
pub fn quote_ident(kind: BackendKind, name: &str) -> String {
    let (open, close) = match kind {
        BackendKind::MySQL => ('`', '`'),
        _ => ('"', '"'),
    };
    name.split('.')
        .map(|part| format!("{open}{part}{close}"))
        .collect::<Vec<_>>()
        .join(".")
}

/// Placeholder for the `n`-th (1-based) bound parameter.
pub fn placeholder(kind: BackendKind, n: usize) -> String {
    match kind {
        BackendKind::PostgreSQL => format!("${}", n),
        _ => "?".to_string(),
    }
}

pub fn begin_statement(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::MySQL => "START TRANSACTION",
        _ => "BEGIN",
    }
}

pub fn savepoint_statement(name: &str) -> String {
    format!("SAVEPOINT {}", name)
}

pub fn rollback_to_savepoint_statement(name: &str) -> String {
    format!("ROLLBACK TO SAVEPOINT {}", name)
}

pub fn release_savepoint_statement(name: &str) -> String {
    format!("RELEASE SAVEPOINT {}", name)
}

/// Multi-row insert for `rows` rows over `columns`.
///
/// PostgreSQL and SQLite return the inserted rows so generated keys are
/// visible to the caller; MySQL relies on `LAST_INSERT_ID()` instead.
pub fn insert_statement(kind: BackendKind, table: &str, columns: &[String], rows: usize) -> String {
    let table = quote_ident(kind, table);
    if columns.is_empty() {
        return match kind {
            BackendKind::MySQL => format!("INSERT INTO {} () VALUES ()", table),
            _ => format!("INSERT INTO {} DEFAULT VALUES RETURNING *", table),
        };
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(kind, c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut n = 0;
    let values = (0..rows)
        .map(|_| {
            let row = columns
                .iter()
                .map(|_| {
                    n += 1;
                    placeholder(kind, n)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", row)
        })
        .collect::<Vec<_>>()
        .join(", ");

    let returning = if kind == BackendKind::MySQL {
        ""
    } else {
        " RETURNING *"
    };
    format!(
        "INSERT INTO {} ({}) VALUES {}{}",
        table, column_list, values, returning
    )
}

pub fn count_statement(kind: BackendKind, table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(kind, table))
}

pub fn delete_statement(kind: BackendKind, table: &str) -> String {
    format!("DELETE FROM {}", quote_ident(kind, table))
}

/// Statements that empty a table in one shot. `None` when the dialect has
/// no truncate and a row delete has to be used instead.
pub fn truncate_statements(
    kind: BackendKind,
    table: &str,
    cascade: bool,
    reset_identity: bool,
) -> Option<Vec<String>> {
    let quoted = quote_ident(kind, table);
    match kind {
        BackendKind::PostgreSQL => {
            let mut stmt = format!("TRUNCATE TABLE {}", quoted);
            if reset_identity {
                stmt.push_str(" RESTART IDENTITY");
            }
            if cascade {
                stmt.push_str(" CASCADE");
            }
            Some(vec![stmt])
        }
        // TRUNCATE always resets AUTO_INCREMENT on MySQL
        BackendKind::MySQL if cascade => Some(vec![
            "SET FOREIGN_KEY_CHECKS = 0".to_string(),
            format!("TRUNCATE TABLE {}", quoted),
            "SET FOREIGN_KEY_CHECKS = 1".to_string(),
        ]),
        BackendKind::MySQL => Some(vec![format!("TRUNCATE TABLE {}", quoted)]),
        BackendKind::SQLite | BackendKind::Document => None,
    }
}

pub fn mysql_reset_auto_increment(table: &str) -> String {
    format!(
        "ALTER TABLE {} AUTO_INCREMENT = 1",
        quote_ident(BackendKind::MySQL, table)
    )
}

/// Split a script into statements on `;` outside quotes and comments.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    // line comment
                    for next in chars.by_ref() {
                        if next == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                ';' => {
                    let stmt = current.trim();
                    if !stmt.is_empty() {
                        statements.push(stmt.to_string());
                    }
                    current.clear();
                }
                _ => current.push(c),
            },
        }
    }
    let stmt = current.trim();
    if !stmt.is_empty() {
        statements.push(stmt.to_string());
    }
    statements
}

pub(crate) mod queries {
    pub mod postgres {
        pub const LIST_TABLES: &str = r#"
            SELECT tablename::text
            FROM pg_catalog.pg_tables
            WHERE schemaname = current_schema()
            ORDER BY tablename
            "#;

        pub const FOREIGN_KEYS: &str = r#"
            SELECT
                tc.table_name::text AS table_name,
                kcu.column_name::text AS column_name,
                ccu.table_name::text AS foreign_table_name,
                ccu.column_name::text AS foreign_column_name
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON ccu.constraint_name = tc.constraint_name
                AND ccu.table_schema = tc.table_schema
            WHERE tc.table_schema = current_schema()
            AND tc.constraint_type = 'FOREIGN KEY'
            "#;

        pub const SERIAL_COLUMNS: &str = r#"
            SELECT a.attname::text
            FROM pg_catalog.pg_attribute a
            WHERE a.attrelid = $1::regclass
            AND a.attnum > 0
            AND NOT a.attisdropped
            AND pg_get_serial_sequence($1, a.attname) IS NOT NULL
            "#;

        pub const RESET_SEQUENCE: &str =
            "SELECT setval(pg_get_serial_sequence($1, $2), 1, false)";
    }

    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#;

        pub const FOREIGN_KEYS: &str = r#"
            SELECT
                CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
                CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
                CONVERT(REFERENCED_TABLE_NAME USING utf8) AS REFERENCED_TABLE_NAME,
                CONVERT(REFERENCED_COLUMN_NAME USING utf8) AS REFERENCED_COLUMN_NAME
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE TABLE_SCHEMA = DATABASE()
            AND REFERENCED_TABLE_NAME IS NOT NULL
            "#;
    }

    pub mod sqlite {
        pub const LIST_TABLES: &str = r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table'
            AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;

        pub const HAS_SEQUENCE_TABLE: &str =
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'";

        pub const RESET_SEQUENCE: &str = "DELETE FROM sqlite_sequence WHERE name = ?";
    }
}
