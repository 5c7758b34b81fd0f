//! Database schemas for Keygate

mod metadata;
mod user;

pub use metadata::Metadata;
pub use user::{KeyBinding, KeyRef, UserDoc, USER_COLLECTION};
