//! Host registry backed by a JSON file
//!
//! The file holds an ordered list of `{host, api_url, current_devices,
//! max_devices}` objects. Every read-modify-write of the file goes through a
//! single write gate, so concurrent grants, revokes and reconciliation runs
//! cannot lose each other's counter updates.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::hosts::selector;
use crate::types::{KeygateError, Result};

/// A VPN host with a key-management API and a device limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Address clients connect to; also the host identifier
    pub host: String,
    /// Base URL of the host's key-management API
    pub api_url: String,
    pub current_devices: u32,
    pub max_devices: u32,
}

impl Host {
    pub fn has_free_slot(&self) -> bool {
        self.current_devices < self.max_devices
    }

    /// Management API base URL without a trailing slash
    pub fn api_base(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }
}

/// File-backed host registry with a single-writer discipline
pub struct HostRegistry {
    path: PathBuf,
    /// Serializes every write to the file
    write_gate: Mutex<()>,
    /// Grants selected but not yet committed, by host id
    pending: Arc<DashMap<String, u32>>,
}

impl HostRegistry {
    /// Create a registry for the given file (the file is not touched yet)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_gate: Mutex::new(()),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the host list.
    ///
    /// An unreadable file is `RegistryUnavailable`. Content that is not a
    /// well-formed host list is reported loudly and read as an empty list.
    pub async fn load(&self) -> Result<Vec<Host>> {
        let raw = self.read_raw().await?;
        match serde_json::from_str::<Vec<Host>>(&raw) {
            Ok(hosts) => Ok(hosts),
            Err(e) => {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Host registry is not a well-formed host list, treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Load for read-modify-write: malformed content is an error so that a
    /// corrupted file is never overwritten with an empty list.
    pub async fn load_strict(&self) -> Result<Vec<Host>> {
        let raw = self.read_raw().await?;
        serde_json::from_str::<Vec<Host>>(&raw).map_err(|e| {
            error!(path = %self.path.display(), error = %e, "Refusing to rewrite malformed host registry");
            KeygateError::RegistryUnavailable(format!(
                "{} is not a well-formed host list: {}",
                self.path.display(),
                e
            ))
        })
    }

    async fn read_raw(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            KeygateError::RegistryUnavailable(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Look up a host by id
    pub async fn find(&self, host_id: &str) -> Result<Option<Host>> {
        let hosts = self.load().await?;
        Ok(hosts.into_iter().find(|h| h.host == host_id))
    }

    /// Atomically overwrite the persisted host list
    pub async fn save(&self, hosts: &[Host]) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        self.write(hosts).await
    }

    /// Write to a sibling temp file, then rename over the registry.
    /// Caller must hold the write gate.
    async fn write(&self, hosts: &[Host]) -> Result<()> {
        let body = serde_json::to_vec_pretty(hosts)
            .map_err(|e| KeygateError::Internal(format!("Failed to encode hosts: {}", e)))?;
        let temp = self.temp_path();

        let unavailable = |e: std::io::Error| {
            KeygateError::RegistryUnavailable(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            ))
        };

        let mut file = tokio::fs::File::create(&temp).await.map_err(unavailable)?;
        file.write_all(&body).await.map_err(unavailable)?;
        file.sync_all().await.map_err(unavailable)?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(unavailable)?;

        debug!(path = %self.path.display(), hosts = hosts.len(), "Host registry saved");
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "hosts.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Add `delta` to a host's device counter, never going below zero.
    ///
    /// Returns `false` if the host is not in the registry.
    pub async fn adjust_device_count(&self, host_id: &str, delta: i64) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        self.adjust_locked(host_id, delta).await
    }

    /// Caller must hold the write gate.
    async fn adjust_locked(&self, host_id: &str, delta: i64) -> Result<bool> {
        let mut hosts = self.load_strict().await?;

        let Some(host) = hosts.iter_mut().find(|h| h.host == host_id) else {
            warn!(host = %host_id, delta, "Cannot adjust device count, host not in registry");
            return Ok(false);
        };

        let updated = (i64::from(host.current_devices) + delta).max(0);
        host.current_devices = u32::try_from(updated).unwrap_or(u32::MAX);
        if host.current_devices > host.max_devices {
            warn!(
                host = %host_id,
                current = host.current_devices,
                max = host.max_devices,
                "Host is over its device limit"
            );
        }
        let current = host.current_devices;

        self.write(&hosts).await?;
        debug!(host = %host_id, delta, current, "Adjusted device count");
        Ok(true)
    }

    /// Overwrite counters for every host present in `usage`.
    ///
    /// Hosts absent from the mapping keep their counter. Returns the number
    /// of hosts whose counter changed.
    pub async fn reconcile_device_counts(&self, usage: &HashMap<String, u32>) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        let mut hosts = self.load_strict().await?;
        self.reconcile_locked(&mut hosts, usage).await
    }

    /// Recount usage and overwrite the counters without releasing the write
    /// gate in between, so no grant or revoke can land between the count
    /// and the write.
    ///
    /// Every registered host is seeded with 0 before the recount is merged
    /// in. Hosts holding uncommitted reservations are left out: their
    /// in-flight grant may already be bound but not yet counted. Returns the
    /// counts that were applied.
    pub async fn reconcile_with<F, Fut>(&self, recount: F) -> Result<HashMap<String, u32>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<HashMap<String, u32>>>,
    {
        let _gate = self.write_gate.lock().await;
        let mut hosts = self.load_strict().await?;

        let mut usage: HashMap<String, u32> =
            hosts.iter().map(|h| (h.host.clone(), 0)).collect();
        for (host, count) in recount().await? {
            usage.insert(host, count);
        }

        usage.retain(|host, _| {
            let pending = self.pending_for(host);
            if pending > 0 {
                debug!(host = %host, pending, "Grant in flight, counter left for next reconciliation");
            }
            pending == 0
        });

        let changed = self.reconcile_locked(&mut hosts, &usage).await?;
        info!(hosts = changed, "Capacity reconciliation finished");
        Ok(usage)
    }

    /// Caller must hold the write gate.
    async fn reconcile_locked(
        &self,
        hosts: &mut [Host],
        usage: &HashMap<String, u32>,
    ) -> Result<usize> {
        let mut changed = 0;
        for host in hosts.iter_mut() {
            if let Some(&count) = usage.get(&host.host) {
                if host.current_devices != count {
                    info!(
                        host = %host.host,
                        from = host.current_devices,
                        to = count,
                        "Reconciled device count"
                    );
                    host.current_devices = count;
                    changed += 1;
                }
            }
        }

        for unknown in usage.keys().filter(|k| !hosts.iter().any(|h| &h.host == *k)) {
            warn!(host = %unknown, "Users are bound to a host missing from the registry");
        }

        self.write(hosts).await?;
        Ok(changed)
    }

    /// Pick a host for a new grant and hold its slot until committed.
    ///
    /// Selection counts uncommitted reservations against capacity, so
    /// concurrent grants cannot oversell the last free slot. Returns `None`
    /// when no host has room.
    pub async fn reserve_slot(&self) -> Result<Option<SlotReservation>> {
        let _gate = self.write_gate.lock().await;
        let hosts = self.load().await?;

        let effective: Vec<Host> = hosts
            .iter()
            .map(|h| {
                let mut view = h.clone();
                view.current_devices = view
                    .current_devices
                    .saturating_add(self.pending_for(&h.host));
                view
            })
            .collect();

        let Some(selected) = selector::select_available(&effective) else {
            return Ok(None);
        };
        let Some(host) = hosts.into_iter().find(|h| h.host == selected.host) else {
            return Ok(None);
        };

        *self.pending.entry(host.host.clone()).or_insert(0) += 1;
        debug!(host = %host.host, "Reserved slot");

        Ok(Some(SlotReservation {
            host,
            pending: Arc::clone(&self.pending),
            released: false,
        }))
    }

    /// Uncommitted reservations currently held on a host
    pub fn pending_for(&self, host_id: &str) -> u32 {
        self.pending.get(host_id).map(|v| *v).unwrap_or(0)
    }
}

/// A held slot on a host, released on drop unless committed
pub struct SlotReservation {
    host: Host,
    pending: Arc<DashMap<String, u32>>,
    released: bool,
}

impl SlotReservation {
    /// The host as loaded when the slot was reserved
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Apply the +1 to the host's persisted counter and release the hold,
    /// both under the registry write gate.
    ///
    /// The hold is released even when the counter update fails; the
    /// reconciliation job repairs the counter.
    pub async fn commit(mut self, registry: &HostRegistry) -> Result<bool> {
        let _gate = registry.write_gate.lock().await;
        let result = registry.adjust_locked(&self.host.host, 1).await;
        self.release();
        result
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(mut count) = self.pending.get_mut(&self.host.host) {
            *count = count.saturating_sub(1);
        }
        self.pending.remove_if(&self.host.host, |_, v| *v == 0);
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.release();
    }
}
