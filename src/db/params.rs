//! Parameter binding for parameterized statements.
//!
//! sqlx argument buffers are database-specific, so one binder is generated
//! per backend. They differ only in how JSON values travel.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! param_binder {
    ($name:ident<$q:lifetime>, $db:ty, $args:ty, |$json:ident| $bind_json:expr) => {
        pub(crate) fn $name<$q>(query: Query<$q, $db, $args>, param: &$q QueryParam) -> Query<$q, $db, $args> {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(b) => query.bind(*b),
                QueryParam::Int(i) => query.bind(*i),
                QueryParam::Float(f) => query.bind(*f),
                QueryParam::String(s) => query.bind(s.as_str()),
                QueryParam::Bytes(bytes) => query.bind(bytes.as_slice()),
                QueryParam::Json($json) => query.bind($bind_json),
            }
        }
    };
}

param_binder!(bind_postgres_param<'q>, Postgres, PgArguments, |value| Json(value));
param_binder!(bind_mysql_param<'q>, MySql, MySqlArguments, |value| Json(value));
// No native JSON column type; stored as text
param_binder!(bind_sqlite_param<'q>, Sqlite, SqliteArguments<'q>, |value| value.to_string());
