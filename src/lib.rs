//! Keygate - VPN access-key provisioning
//!
//! Grants per-user access keys on a pool of capacity-limited VPN hosts,
//! revokes them when subscriptions end, and resolves dynamic keys to current
//! connection parameters.
//!
//! ## Components
//!
//! - **Hosts**: file-backed host registry and first-fit host selection
//! - **Services**: key-management client, lifecycle coordinator, maintenance
//!   jobs and host migration
//! - **Db**: user records in MongoDB (or memory in dev mode)
//! - **Server**: `GET /conf/{id}` lookup endpoint

pub mod app;
pub mod config;
pub mod db;
pub mod hosts;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{KeygateError, Result};
