//! Connection pool setup and the embedded migrator, mirroring the
//! teacher's `database::migrator::MIGRATOR` static used by both the
//! running service and `#[sqlx::test]` in the adapter test modules.

use sqlx::postgres::{PgPool, PgPoolOptions};

use bridge_shared::errors::{BridgeError, BridgeResult};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect(database_url: &str) -> BridgeResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| BridgeError::database("connect", e))
}

pub async fn migrate(pool: &PgPool) -> BridgeResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| BridgeError::database("migrate", e))
}
