//! Keygate Admin - operator commands
//!
//! Runs the maintenance jobs on demand and performs one-off key operations
//! against the same configuration as the service.
//!
//! Usage:
//!   keygate-admin sweep
//!   keygate-admin reconcile
//!   keygate-admin migrate --from old.example.net --to new.example.net
//!   keygate-admin revoke-user --user-id 123456789
//!   keygate-admin provision --user-id 123456789
//!   keygate-admin trial --user-id 123456789
//!   keygate-admin hosts

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keygate::{
    app::build_coordinator,
    config::Args,
    hosts::free_slots,
    services::{migrate_host, LogNotifier, Maintenance},
};

#[derive(Parser, Debug)]
#[command(name = "keygate-admin")]
#[command(about = "Operator commands for Keygate")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    args: Args,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Revoke expired keys and send reminders
    Sweep,
    /// Recount bound keys and rewrite host counters
    Reconcile,
    /// Move every key from one host to another
    Migrate {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Revoke the key a user holds
    RevokeUser {
        #[arg(long)]
        user_id: i64,
    },
    /// Grant a key to a user, creating the user record if needed
    Provision {
        #[arg(long)]
        user_id: i64,
    },
    /// Start a user's free trial
    Trial {
        #[arg(long)]
        user_id: i64,
    },
    /// Print the host registry
    Hosts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("keygate={},warn", cli.args.log_level))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = cli.args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let coordinator = build_coordinator(&cli.args).await?;

    match cli.command {
        Command::Sweep => {
            let maintenance = Maintenance::new(Arc::clone(&coordinator), Arc::new(LogNotifier))
                .with_reminder_window_hours(cli.args.reminder_window_hours);
            let report = maintenance.run_expiry_sweep(Utc::now()).await?;
            println!("{:#?}", report);
        }
        Command::Reconcile => {
            let usage = coordinator.reconcile_capacity().await?;
            let mut hosts: Vec<_> = usage.into_iter().collect();
            hosts.sort();
            for (host, count) in hosts {
                println!("{:<40} {}", host, count);
            }
        }
        Command::Migrate { from, to } => {
            let report = migrate_host(
                Arc::clone(&coordinator),
                &from,
                &to,
                cli.args.migration_concurrency,
            )
            .await?;
            println!("{:#?}", report);
        }
        Command::RevokeUser { user_id } => {
            if coordinator.revoke_user(user_id).await? {
                println!("Key of user {} revoked", user_id);
            } else {
                println!("User {} holds no key", user_id);
            }
        }
        Command::Provision { user_id } => {
            coordinator.users().ensure_user(user_id, None).await?;
            let dynamic_key = coordinator.provision(user_id).await?;
            println!("{}", dynamic_key);
        }
        Command::Trial { user_id } => {
            let dynamic_key = coordinator.activate_trial(user_id).await?;
            println!("{}", dynamic_key);
        }
        Command::Hosts => {
            let hosts = coordinator.registry().load().await?;
            for host in &hosts {
                println!(
                    "{:<40} {:>5}/{:<5} {}",
                    host.host, host.current_devices, host.max_devices, host.api_url
                );
            }
            println!("{} hosts, {} free slots", hosts.len(), free_slots(&hosts));
        }
    }

    Ok(())
}
