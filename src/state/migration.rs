use crate::CRATE_NAME;
use sqlx::SqlitePool;
use sqlx::migrate::MigrateError;
use tracing::warn;

// Kept apart so the migrate! macro expansion stays out of the query code
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    match sqlx::migrate!("db/migrations").run(pool).await {
        Ok(()) => Ok(()),
        Err(MigrateError::VersionMissing(num)) => {
            warn!(
                "{CRATE_NAME} is missing database migration {num}. This indicates a version downgrade."
            );
            warn!("Continuing without database migration, stored records may not be readable.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
