//! Wiring shared by the binaries

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Args;
use crate::db::{MemoryUserStore, MongoClient, MongoUserStore, UserStore};
use crate::hosts::HostRegistry;
use crate::services::{DynamicKeyBuilder, IdCipher, KeyLifecycleCoordinator, OutlineClient};
use crate::types::{KeygateError, Result};

/// Build the coordinator from configuration: record store, host registry,
/// key-management client and dynamic key builder.
pub async fn build_coordinator(args: &Args) -> Result<Arc<KeyLifecycleCoordinator>> {
    let key = args.secret_key_bytes().map_err(KeygateError::Config)?;
    let cipher = IdCipher::new(args.id_cipher, &key)?;
    let dynamic_keys = Arc::new(DynamicKeyBuilder::new(
        args.key_domain(),
        args.connection_label.clone(),
        cipher,
    ));

    let users: Arc<dyn UserStore> = if args.dev_mode {
        warn!("Using in-memory user records, nothing will be persisted");
        Arc::new(MemoryUserStore::new())
    } else {
        let mongo = MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await?;
        Arc::new(MongoUserStore::new(&mongo).await?)
    };

    let registry = Arc::new(HostRegistry::new(&args.hosts_file));
    match registry.load().await {
        Ok(hosts) => info!(
            path = %args.hosts_file.display(),
            hosts = hosts.len(),
            "Host registry loaded"
        ),
        Err(e) => warn!(error = %e, "Host registry not readable yet"),
    }

    let keys = Arc::new(OutlineClient::new(args.request_timeout())?);

    Ok(Arc::new(
        KeyLifecycleCoordinator::new(registry, keys, users, dynamic_keys)
            .with_trial_days(args.trial_days),
    ))
}
