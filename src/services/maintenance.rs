//! Periodic maintenance: expiry sweep and capacity reconciliation
//!
//! Both jobs are plain async entry points. `spawn_maintenance_task` runs them
//! on an interval; the admin binary runs them on demand.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::db::UserDoc;
use crate::services::coordinator::KeyLifecycleCoordinator;
use crate::types::Result;

/// Default reminder window before a subscription ends
pub const DEFAULT_REMINDER_WINDOW_HOURS: u32 = 72;

/// What the user is told after a sweep decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryNotice {
    TrialExpired,
    SubscriptionExpired,
    SubscriptionEndingSoon { hours_left: i64 },
}

/// Delivers expiry notices to users (the chat front end in production)
#[async_trait]
pub trait ExpiryNotifier: Send + Sync {
    async fn notify(&self, user: &UserDoc, notice: ExpiryNotice);
}

/// Notifier that only logs
pub struct LogNotifier;

#[async_trait]
impl ExpiryNotifier for LogNotifier {
    async fn notify(&self, user: &UserDoc, notice: ExpiryNotice) {
        info!(user_id = user.telegram_id, ?notice, "Expiry notice");
    }
}

/// Outcome of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub trials_expired: usize,
    pub subscriptions_expired: usize,
    pub reminders: usize,
    pub failures: usize,
    /// Another sweep was already running
    pub skipped: bool,
}

/// What happened to one expired user's key during a sweep
enum SweepRevoke {
    Revoked,
    /// The binding was removed by someone else first
    AlreadyGone,
    Failed,
}

pub struct Maintenance {
    coordinator: Arc<KeyLifecycleCoordinator>,
    notifier: Arc<dyn ExpiryNotifier>,
    reminder_window: ChronoDuration,
    sweep_gate: Mutex<()>,
}

impl Maintenance {
    pub fn new(coordinator: Arc<KeyLifecycleCoordinator>, notifier: Arc<dyn ExpiryNotifier>) -> Self {
        Self {
            coordinator,
            notifier,
            reminder_window: ChronoDuration::hours(DEFAULT_REMINDER_WINDOW_HOURS as i64),
            sweep_gate: Mutex::new(()),
        }
    }

    pub fn with_reminder_window_hours(mut self, hours: u32) -> Self {
        self.reminder_window = ChronoDuration::hours(hours as i64);
        self
    }

    /// Revoke keys of expired trials and subscriptions, remind users whose
    /// subscription is about to end. One user's failure does not stop the
    /// sweep.
    pub async fn run_expiry_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let Ok(_gate) = self.sweep_gate.try_lock() else {
            warn!("Expiry sweep already running, skipping");
            return Ok(SweepReport {
                skipped: true,
                ..Default::default()
            });
        };

        let users = self.coordinator.users().list().await?;
        let mut report = SweepReport {
            scanned: users.len(),
            ..Default::default()
        };

        for user in &users {
            let user_id = user.telegram_id;
            let bound = user.key.is_some();

            let trial_over = user.trial_used
                && user.subscription_end.is_none()
                && user.trial_end_at().is_some_and(|end| end <= now);
            if trial_over && bound {
                match self.revoke(user, ExpiryNotice::TrialExpired).await {
                    SweepRevoke::Revoked => report.trials_expired += 1,
                    SweepRevoke::AlreadyGone => {}
                    SweepRevoke::Failed => report.failures += 1,
                }
                continue;
            }

            let (Some(end), true) = (user.subscription_end_at(), bound) else {
                continue;
            };

            if end <= now {
                match self.revoke(user, ExpiryNotice::SubscriptionExpired).await {
                    SweepRevoke::Revoked => report.subscriptions_expired += 1,
                    SweepRevoke::AlreadyGone => {}
                    SweepRevoke::Failed => report.failures += 1,
                }
            } else if end - now <= self.reminder_window {
                let hours_left = (end - now).num_hours();
                debug!(user_id, hours_left, "Subscription ending soon");
                self.notifier
                    .notify(user, ExpiryNotice::SubscriptionEndingSoon { hours_left })
                    .await;
                report.reminders += 1;
            }
        }

        info!(
            scanned = report.scanned,
            trials_expired = report.trials_expired,
            subscriptions_expired = report.subscriptions_expired,
            reminders = report.reminders,
            failures = report.failures,
            "Expiry sweep finished"
        );
        Ok(report)
    }

    async fn revoke(&self, user: &UserDoc, notice: ExpiryNotice) -> SweepRevoke {
        match self.coordinator.revoke_user(user.telegram_id).await {
            Ok(true) => {
                self.notifier.notify(user, notice).await;
                SweepRevoke::Revoked
            }
            Ok(false) => {
                debug!(user_id = user.telegram_id, "Key already revoked elsewhere");
                SweepRevoke::AlreadyGone
            }
            Err(e) => {
                let key = user.key_ref();
                error!(
                    user_id = user.telegram_id,
                    host = key.as_ref().map(|k| k.host.as_str()).unwrap_or_default(),
                    key_id = key.as_ref().map(|k| k.key_id.as_str()).unwrap_or_default(),
                    error = %e,
                    "Failed to revoke expired key"
                );
                SweepRevoke::Failed
            }
        }
    }

    /// Recount bound keys per host and overwrite the registry counters
    pub async fn run_capacity_reconciliation(&self) -> Result<HashMap<String, u32>> {
        self.coordinator.reconcile_capacity().await
    }

    /// Sweep then reconcile, logging instead of returning errors
    pub async fn run_once(&self) {
        if let Err(e) = self.run_expiry_sweep(Utc::now()).await {
            error!(error = %e, "Expiry sweep failed");
        }
        if let Err(e) = self.run_capacity_reconciliation().await {
            error!(error = %e, "Capacity reconciliation failed");
        }
    }
}

/// Run the maintenance jobs every `interval`
pub fn spawn_maintenance_task(maintenance: Arc<Maintenance>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            maintenance.run_once().await;
        }
    });
    info!(interval_secs = interval.as_secs(), "Maintenance task started");
}
