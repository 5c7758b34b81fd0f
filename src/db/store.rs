//! User record store
//!
//! Every operation is one narrow read or one conditional update; nothing
//! holds a record open across a network call.

use async_trait::async_trait;
use bson::{doc, DateTime};
use chrono::{DateTime as ChronoDateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::db::mongo::{MongoClient, MongoCollection};
use crate::db::schemas::{KeyBinding, KeyRef, UserDoc, USER_COLLECTION};
use crate::types::{KeygateError, Result};

/// Per-user subscription and key state
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, user_id: i64) -> Result<Option<UserDoc>>;

    /// Fetch the user, creating an empty record on first contact
    async fn ensure_user(&self, user_id: i64, username: Option<&str>) -> Result<UserDoc>;

    async fn find_by_key(&self, key: &KeyRef) -> Result<Option<UserDoc>>;

    /// Set the key binding and dynamic key. False if the user does not exist.
    async fn bind_key(&self, user_id: i64, binding: &KeyBinding, dynamic_key: &str)
        -> Result<bool>;

    /// Remove the binding if it is still `key`. False if it was not.
    async fn clear_key(&self, user_id: i64, key: &KeyRef) -> Result<bool>;

    /// Mark the trial as used and set its end
    async fn record_trial(&self, user_id: i64, trial_end: ChronoDateTime<Utc>) -> Result<bool>;

    async fn list(&self) -> Result<Vec<UserDoc>>;

    /// Users whose key lives on `host`
    async fn list_on_host(&self, host: &str) -> Result<Vec<UserDoc>>;
}

/// MongoDB backed store
#[derive(Clone)]
pub struct MongoUserStore {
    users: MongoCollection<UserDoc>,
}

impl MongoUserStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        let users = client.collection::<UserDoc>(USER_COLLECTION).await?;
        Ok(Self { users })
    }
}

#[async_trait]
impl UserStore for MongoUserStore {
    async fn get(&self, user_id: i64) -> Result<Option<UserDoc>> {
        self.users.find_one(doc! { "telegram_id": user_id }).await
    }

    async fn ensure_user(&self, user_id: i64, username: Option<&str>) -> Result<UserDoc> {
        let now = DateTime::now();
        let mut on_insert = doc! {
            "trial_used": false,
            "metadata": { "is_deleted": false, "created_at": now, "updated_at": now },
        };
        if let Some(name) = username {
            on_insert.insert("username", name);
        }

        self.users
            .upsert_one(doc! { "telegram_id": user_id }, doc! { "$setOnInsert": on_insert })
            .await?;

        self.get(user_id).await?.ok_or_else(|| {
            KeygateError::RecordStore(format!("User {} vanished after upsert", user_id))
        })
    }

    async fn find_by_key(&self, key: &KeyRef) -> Result<Option<UserDoc>> {
        self.users
            .find_one(doc! { "key.host": &key.host, "key.key_id": &key.key_id })
            .await
    }

    async fn bind_key(
        &self,
        user_id: i64,
        binding: &KeyBinding,
        dynamic_key: &str,
    ) -> Result<bool> {
        let update = doc! {
            "$set": {
                "key": bson::to_bson(binding)?,
                "dynamic_key": dynamic_key,
                "metadata.updated_at": DateTime::now(),
            }
        };
        let result = self
            .users
            .update_one(doc! { "telegram_id": user_id }, update)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn clear_key(&self, user_id: i64, key: &KeyRef) -> Result<bool> {
        let filter = doc! {
            "telegram_id": user_id,
            "key.host": &key.host,
            "key.key_id": &key.key_id,
        };
        let update = doc! {
            "$unset": { "key": "" },
            "$set": { "metadata.updated_at": DateTime::now() },
        };
        let result = self.users.update_one(filter, update).await?;
        Ok(result.matched_count > 0)
    }

    async fn record_trial(&self, user_id: i64, trial_end: ChronoDateTime<Utc>) -> Result<bool> {
        let update = doc! {
            "$set": {
                "trial_used": true,
                "trial_end_date": DateTime::from_chrono(trial_end),
                "metadata.updated_at": DateTime::now(),
            }
        };
        let result = self
            .users
            .update_one(doc! { "telegram_id": user_id }, update)
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn list(&self) -> Result<Vec<UserDoc>> {
        self.users.find_many(doc! {}).await
    }

    async fn list_on_host(&self, host: &str) -> Result<Vec<UserDoc>> {
        self.users.find_many(doc! { "key.host": host }).await
    }
}

/// In-memory store for dev mode and tests
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    users: Arc<DashMap<i64, UserDoc>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record
    pub fn insert(&self, user: UserDoc) {
        self.users.insert(user.telegram_id, user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get(&self, user_id: i64) -> Result<Option<UserDoc>> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn ensure_user(&self, user_id: i64, username: Option<&str>) -> Result<UserDoc> {
        let entry = self.users.entry(user_id).or_insert_with(|| {
            debug!(user_id, "Creating user record");
            UserDoc::new(user_id, username.map(str::to_string))
        });
        Ok(entry.clone())
    }

    async fn find_by_key(&self, key: &KeyRef) -> Result<Option<UserDoc>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.key_ref().as_ref() == Some(key))
            .map(|u| u.clone()))
    }

    async fn bind_key(
        &self,
        user_id: i64,
        binding: &KeyBinding,
        dynamic_key: &str,
    ) -> Result<bool> {
        match self.users.get_mut(&user_id) {
            Some(mut user) => {
                user.key = Some(binding.clone());
                user.dynamic_key = Some(dynamic_key.to_string());
                user.metadata.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear_key(&self, user_id: i64, key: &KeyRef) -> Result<bool> {
        match self.users.get_mut(&user_id) {
            Some(mut user) if user.key_ref().as_ref() == Some(key) => {
                user.key = None;
                user.metadata.touch();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_trial(&self, user_id: i64, trial_end: ChronoDateTime<Utc>) -> Result<bool> {
        match self.users.get_mut(&user_id) {
            Some(mut user) => {
                user.trial_used = true;
                user.trial_end_date = Some(DateTime::from_chrono(trial_end));
                user.metadata.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<UserDoc>> {
        Ok(self.users.iter().map(|u| u.clone()).collect())
    }

    async fn list_on_host(&self, host: &str) -> Result<Vec<UserDoc>> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.key.as_ref().is_some_and(|k| k.host == host))
            .map(|u| u.clone())
            .collect())
    }
}

impl From<Vec<UserDoc>> for MemoryUserStore {
    fn from(users: Vec<UserDoc>) -> Self {
        let store = Self::new();
        for user in users {
            store.insert(user);
        }
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn binding(host: &str, key_id: &str) -> KeyBinding {
        KeyBinding {
            host: host.into(),
            key_id: key_id.into(),
            port: 1000,
            password: "pw".into(),
            method: "aes-256-gcm".into(),
            access_url: "ss://x".into(),
        }
    }

    #[tokio::test]
    async fn test_ensure_user_is_idempotent() {
        let store = MemoryUserStore::new();
        let first = store.ensure_user(1, Some("alice")).await.unwrap();
        store.record_trial(1, Utc::now()).await.unwrap();
        let second = store.ensure_user(1, Some("bob")).await.unwrap();

        assert_eq!(first.username.as_deref(), Some("alice"));
        assert_eq!(second.username.as_deref(), Some("alice"));
        assert!(second.trial_used);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_bind_and_find_by_key() {
        let store = MemoryUserStore::new();
        store.ensure_user(1, None).await.unwrap();
        store.ensure_user(2, None).await.unwrap();

        assert!(store.bind_key(1, &binding("h1", "5"), "ssconf://a").await.unwrap());
        assert!(store.bind_key(2, &binding("h2", "5"), "ssconf://b").await.unwrap());
        assert!(!store.bind_key(3, &binding("h1", "6"), "ssconf://c").await.unwrap());

        // Same key id on different hosts
        let found = store.find_by_key(&KeyRef::new("h2", "5")).await.unwrap().unwrap();
        assert_eq!(found.telegram_id, 2);
        assert!(store.find_by_key(&KeyRef::new("h3", "5")).await.unwrap().is_none());

        let on_h1 = store.list_on_host("h1").await.unwrap();
        assert_eq!(on_h1.len(), 1);
        assert_eq!(on_h1[0].telegram_id, 1);
    }

    #[tokio::test]
    async fn test_clear_key_is_conditional() {
        let store = MemoryUserStore::new();
        assert_ok!(store.ensure_user(1, None).await);
        assert_ok!(store.bind_key(1, &binding("h1", "5"), "ssconf://a").await);

        assert!(!assert_ok!(store.clear_key(1, &KeyRef::new("h1", "6")).await));
        assert!(store.get(1).await.unwrap().unwrap().key.is_some());

        assert!(assert_ok!(store.clear_key(1, &KeyRef::new("h1", "5")).await));
        let user = store.get(1).await.unwrap().unwrap();
        assert!(user.key.is_none());
        assert_eq!(user.dynamic_key.as_deref(), Some("ssconf://a"));

        assert!(!assert_ok!(store.clear_key(1, &KeyRef::new("h1", "5")).await));
    }
}
