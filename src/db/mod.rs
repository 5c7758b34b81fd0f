//! User record storage
//!
//! MongoDB access goes through [`MongoClient`]/[`MongoCollection`]; the
//! coordinator only sees the [`UserStore`] trait.

pub mod mongo;
pub mod schemas;
pub mod store;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection};
pub use schemas::{KeyBinding, KeyRef, Metadata, UserDoc, USER_COLLECTION};
pub use store::{MemoryUserStore, MongoUserStore, UserStore};
