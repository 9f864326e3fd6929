use crate::CRATE_NAME;
use fs4::tokio::AsyncFileExt;
use std::path::Path;
use tokio::fs::File;
use tracing::{error, info};

async fn instance_lock(lock_file: &Path) -> std::io::Result<File> {
    let lock_file = File::create(lock_file).await?;
    if lock_file.try_lock_exclusive()? {
        Ok(lock_file)
    } else {
        info!(
            "Another {CRATE_NAME} process is using the same database. Waiting for the other process to exit..."
        );
        tokio::task::spawn_blocking(move || {
            lock_file.lock_exclusive()?;
            Ok(lock_file)
        })
        .await?
    }
}

/// Exclusive lock on a file next to the database, held for as long as the process works
/// on that database.
#[must_use]
#[clippy::has_significant_drop]
pub struct InstanceLock {
    lock_file: File,
}

impl InstanceLock {
    pub async fn exclusive_lock(database_file: &Path) -> std::io::Result<Self> {
        let lock_file = database_file.with_extension("lock");
        let lock_file = instance_lock(&lock_file).await?;
        Ok(Self { lock_file })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock_file.unlock() {
            error!("Failed to release instance lock: {e}");
        }
    }
}
