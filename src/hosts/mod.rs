//! VPN host registry and host selection
//!
//! The registry owns the persisted host list and its device counters; the
//! selector is a pure first-fit choice over a loaded list.

pub mod registry;
pub mod selector;

pub use registry::{Host, HostRegistry, SlotReservation};
pub use selector::{free_slots, has_free_slot, select_available};
