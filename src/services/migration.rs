//! Host migration
//!
//! Moves every key bound to one host onto another, a bounded number of users
//! at a time, then reconciles the host counters.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::services::coordinator::KeyLifecycleCoordinator;
use crate::types::{KeygateError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Users whose binding changed before their turn came
    pub skipped: usize,
    pub failed: usize,
}

/// Move all keys from host `from` to host `to`
pub async fn migrate_host(
    coordinator: Arc<KeyLifecycleCoordinator>,
    from: &str,
    to: &str,
    concurrency: usize,
) -> Result<MigrationReport> {
    if from == to {
        return Err(KeygateError::BadRequest("Source and target host are the same".into()));
    }

    let target = coordinator
        .registry()
        .find(to)
        .await?
        .ok_or_else(|| KeygateError::NotFound(format!("Host {} is not registered", to)))?;

    let users = coordinator.users().list_on_host(from).await?;
    info!(from, to, users = users.len(), "Starting host migration");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for user in users {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .map_err(|e| KeygateError::Internal(format!("Migration semaphore closed: {}", e)))?;
        let coordinator = Arc::clone(&coordinator);
        let target = target.clone();

        tasks.spawn(async move {
            let _permit = permit;
            let user_id = user.telegram_id;
            (user_id, coordinator.move_key(user_id, &target).await)
        });
    }

    let mut report = MigrationReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(true))) => report.migrated += 1,
            Ok((_, Ok(false))) => report.skipped += 1,
            Ok((user_id, Err(e))) => {
                warn!(user_id, from, to, error = %e, "Failed to migrate user");
                report.failed += 1;
            }
            Err(e) => {
                error!(error = %e, "Migration task panicked");
                report.failed += 1;
            }
        }
    }

    if let Err(e) = coordinator.reconcile_capacity().await {
        error!(error = %e, "Capacity reconciliation after migration failed");
    }

    info!(
        from,
        to,
        migrated = report.migrated,
        skipped = report.skipped,
        failed = report.failed,
        "Host migration finished"
    );
    Ok(report)
}
