//! Dispatch macros for the SQL backend.

/// Generate match arms over the `SqlConnection` variants.
///
/// # Example
///
/// ```ignore
/// impl_conn_dispatch!(self, {
///     Postgres(c) => do_postgres(c),
///     MySql(c) => do_mysql(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
#[macro_export]
macro_rules! impl_conn_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::sql::SqlConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_conn_dispatch;
