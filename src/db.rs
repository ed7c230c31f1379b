//! Database connection pool and migrations.
//!
//! Schema lives in `migrations/`:
//! - `orders`: one row per purchase, with the `order_status` enum
//! - `access_keys`: keys of approved orders
//! - `pending_revocations`: remote keys whose deletion is still unconfirmed

use std::time::Duration;

use sqlx::{Pool, Postgres};

pub type DbPool = Pool<Postgres>;

/// Create the PostgreSQL pool shared by the store.
///
/// The HTTP handlers and both scheduler jobs draw from the same pool, so a
/// slow job can starve requests; the acquire timeout turns that into an
/// error instead of a hang.
///
/// # Errors
///
/// Returns an error if the connection string is invalid or the server is
/// unreachable.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Apply pending migrations. Already-applied ones are tracked in `_sqlx_migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
