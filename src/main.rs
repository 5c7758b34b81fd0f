//! Keygate - VPN access-key provisioning service
//!
//! Serves the dynamic key lookup endpoint and runs the periodic expiry sweep
//! and capacity reconciliation.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keygate::{
    app::build_coordinator,
    config::Args,
    server::{self, AppState},
    services::{spawn_maintenance_task, LogNotifier, Maintenance},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keygate={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("Keygate {} starting", env!("CARGO_PKG_VERSION"));
    info!("  Hosts file: {}", args.hosts_file.display());
    info!("  Key domain: {}", args.key_domain());
    info!("  Identifier cipher: {:?}", args.id_cipher);

    let coordinator = build_coordinator(&args).await?;

    let maintenance = Arc::new(
        Maintenance::new(Arc::clone(&coordinator), Arc::new(LogNotifier))
            .with_reminder_window_hours(args.reminder_window_hours),
    );
    spawn_maintenance_task(maintenance, args.sweep_interval());

    let state = Arc::new(AppState::new(args, coordinator));
    server::run(state).await?;

    Ok(())
}
