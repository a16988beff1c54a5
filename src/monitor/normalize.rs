//! Query shape extraction.
//!
//! Literals become `?`, whitespace collapses, keywords are upper-cased, and
//! placeholder lists like `IN (?, ?, ?)` fold to `IN (?)`, so executions that
//! differ only in their values share one shape.

use crate::models::BackendKind;
use regex::Regex;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::sync::LazyLock;

static PLACEHOLDER_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\?(?:\s*,\s*\?)+").expect("static regex"));

static FALLBACK_LITERALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"'(?:[^']|'')*'|\b\d+(?:\.\d+)?\b|\$\d+"#).expect("static regex"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

fn dialect_for(kind: BackendKind) -> Box<dyn Dialect> {
    match kind {
        BackendKind::PostgreSQL => Box::new(PostgreSqlDialect {}),
        BackendKind::MySQL => Box::new(MySqlDialect {}),
        BackendKind::SQLite => Box::new(SQLiteDialect {}),
        BackendKind::Document => Box::new(GenericDialect {}),
    }
}

fn tokens(query: &str, kind: BackendKind) -> Option<Vec<Token>> {
    let dialect = dialect_for(kind);
    Tokenizer::new(dialect.as_ref(), query).tokenize().ok()
}

fn is_literal(token: &Token) -> bool {
    matches!(
        token,
        Token::Number(..)
            | Token::SingleQuotedString(_)
            | Token::NationalStringLiteral(_)
            | Token::EscapedStringLiteral(_)
            | Token::HexStringLiteral(_)
            | Token::DollarQuotedString(_)
            | Token::Placeholder(_)
    )
}

/// Literal-free shape of `query`.
pub fn normalize(query: &str, kind: BackendKind) -> String {
    let shape = match tokens(query, kind) {
        Some(tokens) => {
            let mut out = String::with_capacity(query.len());
            let mut pending_space = false;
            for token in &tokens {
                if let Token::Whitespace(_) = token {
                    pending_space = !out.is_empty();
                    continue;
                }
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                match token {
                    t if is_literal(t) => out.push('?'),
                    Token::Word(word) if word.keyword != Keyword::NoKeyword && word.quote_style.is_none() => {
                        out.push_str(&word.value.to_uppercase());
                    }
                    other => out.push_str(&other.to_string()),
                }
            }
            out
        }
        None => {
            let stripped = FALLBACK_LITERALS.replace_all(query, "?");
            WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
        }
    };
    PLACEHOLDER_LIST.replace_all(shape.trim(), "?").into_owned()
}

/// Tables named after `FROM`, `JOIN`, `INTO`, `UPDATE` or `TABLE`.
pub fn referenced_tables(query: &str, kind: BackendKind) -> Vec<String> {
    let Some(tokens) = tokens(query, kind) else {
        return Vec::new();
    };
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut tables = Vec::new();
    let mut i = 0;
    while i < significant.len() {
        let introduces_table = matches!(
            significant[i],
            Token::Word(w) if matches!(
                w.keyword,
                Keyword::FROM | Keyword::JOIN | Keyword::INTO | Keyword::UPDATE | Keyword::TABLE
            )
        );
        i += 1;
        if !introduces_table {
            continue;
        }
        let mut name = String::new();
        while let Some(Token::Word(w)) = significant.get(i) {
            name.push_str(&w.value);
            if matches!(significant.get(i + 1), Some(Token::Period)) {
                name.push('.');
                i += 2;
            } else {
                i += 1;
                break;
            }
        }
        if !name.is_empty() && !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}
