//! Key lifecycle services
//!
//! - `outline`: key-management API client
//! - `dynamic_key`: identifier cipher and dynamic key URIs
//! - `coordinator`: grant and revoke protocols
//! - `maintenance`: expiry sweep and capacity reconciliation
//! - `migration`: moving keys between hosts

pub mod coordinator;
pub mod dynamic_key;
pub mod maintenance;
pub mod migration;
pub mod outline;

pub use coordinator::{KeyLifecycleCoordinator, DEFAULT_TRIAL_DAYS};
pub use dynamic_key::{DynamicKeyBuilder, IdCipher};
pub use maintenance::{
    spawn_maintenance_task, ExpiryNotice, ExpiryNotifier, LogNotifier, Maintenance, SweepReport,
};
pub use migration::{migrate_host, MigrationReport};
pub use outline::{AccessKeyData, KeyManager, OutlineClient};
