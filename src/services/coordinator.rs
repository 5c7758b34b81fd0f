//! Key lifecycle coordinator
//!
//! Grants and revokes access keys, keeping the user record and the host
//! device counters in step with the hosts' own key sets.
//!
//! # Grant
//!
//! `provision` reserves a slot, asks the host for a key, binds the key to the
//! user record and only then commits the slot to the host counter. A failed
//! remote call leaves nothing behind. A failed record write after the host
//! created a key leaves an orphaned remote key; it is logged with host and
//! key id for manual cleanup and is not deleted automatically.
//!
//! # Revoke
//!
//! The host must confirm deletion with 204 before any local state changes,
//! so a failed revoke can simply be retried. Local cleanup failures after a
//! confirmed deletion are logged and repaired by capacity reconciliation.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::db::{KeyBinding, KeyRef, UserDoc, UserStore};
use crate::hosts::{Host, HostRegistry};
use crate::services::dynamic_key::DynamicKeyBuilder;
use crate::services::outline::KeyManager;
use crate::types::{KeygateError, Result};

/// Default free trial length
pub const DEFAULT_TRIAL_DAYS: u32 = 3;

pub struct KeyLifecycleCoordinator {
    registry: Arc<HostRegistry>,
    keys: Arc<dyn KeyManager>,
    users: Arc<dyn UserStore>,
    dynamic_keys: Arc<DynamicKeyBuilder>,
    /// One gate per user so a user never ends up with two live keys
    user_gates: DashMap<i64, Arc<Mutex<()>>>,
    trial_length: ChronoDuration,
}

impl KeyLifecycleCoordinator {
    pub fn new(
        registry: Arc<HostRegistry>,
        keys: Arc<dyn KeyManager>,
        users: Arc<dyn UserStore>,
        dynamic_keys: Arc<DynamicKeyBuilder>,
    ) -> Self {
        Self {
            registry,
            keys,
            users,
            dynamic_keys,
            user_gates: DashMap::new(),
            trial_length: ChronoDuration::days(DEFAULT_TRIAL_DAYS as i64),
        }
    }

    pub fn with_trial_days(mut self, days: u32) -> Self {
        self.trial_length = ChronoDuration::days(days as i64);
        self
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    pub fn keys(&self) -> &Arc<dyn KeyManager> {
        &self.keys
    }

    pub fn dynamic_keys(&self) -> &DynamicKeyBuilder {
        &self.dynamic_keys
    }

    async fn lock_user(&self, user_id: i64) -> OwnedMutexGuard<()> {
        let gate = Arc::clone(self.user_gates.entry(user_id).or_default().value());
        gate.lock_owned().await
    }

    /// Grant a key to `user_id` and return the user's dynamic key.
    ///
    /// A user that already holds a key gets their dynamic key back without
    /// any host being contacted.
    pub async fn provision(&self, user_id: i64) -> Result<String> {
        let _gate = self.lock_user(user_id).await;
        self.provision_locked(user_id).await
    }

    async fn provision_locked(&self, user_id: i64) -> Result<String> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(KeygateError::UserNotFound(user_id))?;

        if user.key.is_some() {
            debug!(user_id, "User already holds a key");
            return match user.dynamic_key {
                Some(dynamic_key) => Ok(dynamic_key),
                None => self.dynamic_keys.build(user_id),
            };
        }

        let dynamic_key = self.dynamic_keys.build(user_id)?;

        let reservation = self
            .registry
            .reserve_slot()
            .await?
            .ok_or(KeygateError::CapacityExhausted)?;
        let host = reservation.host().clone();

        // Dropping the reservation on any early return releases the slot
        let key = self.keys.create_key(&host, &user_id.to_string()).await?;

        let binding = KeyBinding {
            host: host.host.clone(),
            key_id: key.key_id,
            port: key.port,
            password: key.password,
            method: key.method,
            access_url: key.access_url,
        };

        match self.users.bind_key(user_id, &binding, &dynamic_key).await {
            Ok(true) => {}
            Ok(false) => {
                error!(
                    user_id,
                    host = %binding.host,
                    key_id = %binding.key_id,
                    "User record vanished before key could be bound, remote key orphaned"
                );
                return Err(KeygateError::RecordStore(format!(
                    "User {} disappeared during provisioning",
                    user_id
                )));
            }
            Err(e) => {
                error!(
                    user_id,
                    host = %binding.host,
                    key_id = %binding.key_id,
                    error = %e,
                    "Failed to bind key to user record, remote key orphaned"
                );
                return Err(e);
            }
        }

        match reservation.commit(&self.registry).await {
            Ok(true) => {}
            Ok(false) => warn!(
                host = %binding.host,
                "Host left the registry before its counter was bumped"
            ),
            Err(e) => warn!(
                host = %binding.host,
                error = %e,
                "Failed to bump host counter, reconciliation will repair it"
            ),
        }

        info!(user_id, host = %binding.host, key_id = %binding.key_id, "Access key granted");
        Ok(dynamic_key)
    }

    /// Revoke a key, reporting why it could not be revoked
    pub async fn try_revoke(&self, key: &KeyRef) -> Result<()> {
        let owner = self
            .users
            .find_by_key(key)
            .await?
            .ok_or_else(|| KeygateError::UnknownKey(key.to_string()))?;

        let _gate = self.lock_user(owner.telegram_id).await;

        // The binding may have changed while waiting for the gate
        let user = self
            .users
            .get(owner.telegram_id)
            .await?
            .filter(|u| u.key_ref().as_ref() == Some(key))
            .ok_or_else(|| KeygateError::UnknownKey(key.to_string()))?;

        self.revoke_locked(&user, key).await
    }

    /// Revoke a key. True only when the host confirmed the deletion.
    pub async fn revoke(&self, key: &KeyRef) -> bool {
        match self.try_revoke(key).await {
            Ok(()) => true,
            Err(KeygateError::UnknownKey(_)) => {
                debug!(host = %key.host, key_id = %key.key_id, "Key already revoked");
                false
            }
            Err(e) => {
                warn!(host = %key.host, key_id = %key.key_id, error = %e, "Revoke failed");
                false
            }
        }
    }

    /// Revoke whatever key the user holds. `Ok(false)` if they hold none.
    pub async fn revoke_user(&self, user_id: i64) -> Result<bool> {
        let _gate = self.lock_user(user_id).await;

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(KeygateError::UserNotFound(user_id))?;

        let Some(key) = user.key_ref() else {
            return Ok(false);
        };

        self.revoke_locked(&user, &key).await?;
        Ok(true)
    }

    async fn revoke_locked(&self, user: &UserDoc, key: &KeyRef) -> Result<()> {
        let user_id = user.telegram_id;

        let host = self.registry.find(&key.host).await?.ok_or_else(|| {
            error!(user_id, host = %key.host, key_id = %key.key_id, "Key's host is not in the registry");
            KeygateError::RegistryUnavailable(format!("host {} is not registered", key.host))
        })?;

        if !self.keys.delete_key(&host, &key.key_id).await {
            error!(user_id, host = %key.host, key_id = %key.key_id, "Host did not delete key");
            return Err(KeygateError::DeleteFailed {
                host: key.host.clone(),
                key_id: key.key_id.clone(),
            });
        }

        match self.registry.adjust_device_count(&key.host, -1).await {
            Ok(true) => {}
            Ok(false) => warn!(host = %key.host, "Host left the registry before its counter was lowered"),
            Err(e) => error!(
                user_id,
                host = %key.host,
                key_id = %key.key_id,
                error = %e,
                "Failed to lower host counter after revoke"
            ),
        }

        match self.users.clear_key(user_id, key).await {
            Ok(true) => {}
            Ok(false) => warn!(user_id, host = %key.host, key_id = %key.key_id, "Binding already gone"),
            Err(e) => error!(
                user_id,
                host = %key.host,
                key_id = %key.key_id,
                error = %e,
                "Key deleted on host but user record not cleared"
            ),
        }

        info!(user_id, host = %key.host, key_id = %key.key_id, "Access key revoked");
        Ok(())
    }

    /// Start the free trial: grant a key and record the trial window.
    ///
    /// Refused when the user has an active subscription or used the trial.
    pub async fn activate_trial(&self, user_id: i64) -> Result<String> {
        let _gate = self.lock_user(user_id).await;

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(KeygateError::UserNotFound(user_id))?;

        let now = Utc::now();
        if user.has_active_subscription(now) {
            return Err(KeygateError::TrialUnavailable(
                "You already have an active subscription.".to_string(),
            ));
        }
        if user.trial_used {
            return Err(KeygateError::TrialUnavailable(
                "You have already used your free trial.".to_string(),
            ));
        }

        let dynamic_key = self.provision_locked(user_id).await?;

        let trial_end = now + self.trial_length;
        if !self.users.record_trial(user_id, trial_end).await? {
            return Err(KeygateError::RecordStore(format!(
                "User {} disappeared while recording trial",
                user_id
            )));
        }

        info!(user_id, trial_end = %trial_end, "Trial activated");
        Ok(dynamic_key)
    }

    /// Move a user's key to `target`: create the new key, rebind, then
    /// delete the old key. `Ok(false)` if there was nothing to move.
    ///
    /// Host counters are not touched; callers reconcile afterwards.
    pub async fn move_key(&self, user_id: i64, target: &Host) -> Result<bool> {
        let _gate = self.lock_user(user_id).await;

        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or(KeygateError::UserNotFound(user_id))?;
        let Some(old) = user.key else {
            return Ok(false);
        };
        if old.host == target.host {
            return Ok(false);
        }

        let key = self.keys.create_key(target, &user_id.to_string()).await?;
        let binding = KeyBinding {
            host: target.host.clone(),
            key_id: key.key_id,
            port: key.port,
            password: key.password,
            method: key.method,
            access_url: key.access_url,
        };
        let dynamic_key = match user.dynamic_key {
            Some(dynamic_key) => dynamic_key,
            None => self.dynamic_keys.build(user_id)?,
        };

        if !self.users.bind_key(user_id, &binding, &dynamic_key).await? {
            error!(
                user_id,
                host = %binding.host,
                key_id = %binding.key_id,
                "User record vanished during migration, remote key orphaned"
            );
            return Err(KeygateError::RecordStore(format!(
                "User {} disappeared during migration",
                user_id
            )));
        }

        match self.registry.find(&old.host).await {
            Ok(Some(old_host)) => {
                if !self.keys.delete_key(&old_host, &old.key_id).await {
                    warn!(user_id, host = %old.host, key_id = %old.key_id, "Old key left on host");
                }
            }
            Ok(None) => warn!(user_id, host = %old.host, key_id = %old.key_id, "Old host not registered, key left behind"),
            Err(e) => warn!(user_id, host = %old.host, key_id = %old.key_id, error = %e, "Old key left on host"),
        }

        info!(user_id, from = %old.host, to = %binding.host, key_id = %binding.key_id, "Key moved");
        Ok(true)
    }

    /// Recount bound keys per host from the record store and overwrite the
    /// registry counters. Every registered host is included, so a host
    /// nobody uses drops to 0.
    ///
    /// The recount runs under the registry write gate; grants and revokes
    /// wait for it to finish.
    pub async fn reconcile_capacity(&self) -> Result<HashMap<String, u32>> {
        let users = &self.users;
        self.registry
            .reconcile_with(|| async move {
                let mut counts: HashMap<String, u32> = HashMap::new();
                for user in users.list().await? {
                    if let Some(key) = user.key {
                        *counts.entry(key.host).or_insert(0) += 1;
                    }
                }
                Ok(counts)
            })
            .await
    }
}
