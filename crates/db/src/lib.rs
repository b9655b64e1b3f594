pub mod models;
pub mod queries;
pub mod store;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub use store::PgStore;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Applies the embedded migrations for the tables this service owns.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
