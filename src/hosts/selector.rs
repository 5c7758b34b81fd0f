//! First-fit host selection
//!
//! Deterministic: the first host in registry order with a free slot wins.

use super::registry::Host;

/// Return the first host with `current_devices < max_devices`
pub fn select_available(hosts: &[Host]) -> Option<&Host> {
    hosts.iter().find(|h| h.has_free_slot())
}

/// Whether any host has a free slot
pub fn has_free_slot(hosts: &[Host]) -> bool {
    hosts.iter().any(Host::has_free_slot)
}

/// Total free slots across all hosts
pub fn free_slots(hosts: &[Host]) -> u64 {
    hosts
        .iter()
        .map(|h| u64::from(h.max_devices.saturating_sub(h.current_devices)))
        .sum()
}
