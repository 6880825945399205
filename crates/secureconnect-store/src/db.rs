use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Opens a connection pool. Mirrors the pool sizing used by the rest of
/// this codebase's services.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
