//! User document schema
//!
//! Subscription state and the currently bound access key of a chat user.

use bson::{doc, oid::ObjectId, DateTime, Document};
use chrono::{DateTime as ChronoDateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::mongo::IntoIndexes;
use crate::db::schemas::Metadata;

/// Collection name for users
pub const USER_COLLECTION: &str = "users";

/// Identity of an issued key. Key ids are only unique per host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyRef {
    pub host: String,
    pub key_id: String,
}

impl KeyRef {
    pub fn new(host: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            key_id: key_id.into(),
        }
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key_id, self.host)
    }
}

/// Access key bound to a user. Present or absent as a whole.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyBinding {
    pub host: String,
    pub key_id: String,
    pub port: u16,
    pub password: String,
    pub method: String,
    pub access_url: String,
}

impl KeyBinding {
    pub fn key_ref(&self) -> KeyRef {
        KeyRef::new(&self.host, &self.key_id)
    }
}

/// User document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct UserDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    /// Telegram user id
    pub telegram_id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Paid access ends here. Written by the payment flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_end: Option<DateTime>,

    #[serde(default)]
    pub trial_used: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_end_date: Option<DateTime>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyBinding>,

    /// Survives key revocation; it only depends on the user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_key: Option<String>,
}

impl UserDoc {
    pub fn new(telegram_id: i64, username: Option<String>) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            telegram_id,
            username,
            ..Default::default()
        }
    }

    pub fn subscription_end_at(&self) -> Option<ChronoDateTime<Utc>> {
        self.subscription_end.map(|d| d.to_chrono())
    }

    pub fn trial_end_at(&self) -> Option<ChronoDateTime<Utc>> {
        self.trial_end_date.map(|d| d.to_chrono())
    }

    pub fn has_active_subscription(&self, now: ChronoDateTime<Utc>) -> bool {
        self.subscription_end_at().is_some_and(|end| end > now)
    }

    pub fn has_active_trial(&self, now: ChronoDateTime<Utc>) -> bool {
        self.trial_end_at().is_some_and(|end| end > now)
    }

    /// Whether the lookup endpoint may hand out connection parameters
    pub fn has_access(&self, now: ChronoDateTime<Utc>) -> bool {
        self.has_active_subscription(now) || self.has_active_trial(now)
    }

    pub fn key_ref(&self) -> Option<KeyRef> {
        self.key.as_ref().map(KeyBinding::key_ref)
    }
}

impl IntoIndexes for UserDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "telegram_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("telegram_id_unique".to_string())
                        .build(),
                ),
            ),
            // Revoke and migration look users up by key and by host
            (
                doc! { "key.host": 1, "key.key_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("key_ref_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "subscription_end": 1 },
                Some(
                    IndexOptions::builder()
                        .name("subscription_end_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn binding() -> KeyBinding {
        KeyBinding {
            host: "h1".into(),
            key_id: "7".into(),
            port: 31337,
            password: "pw".into(),
            method: "chacha20-ietf-poly1305".into(),
            access_url: "ss://x".into(),
        }
    }

    #[test]
    fn test_access_window() {
        let now = Utc::now();
        let mut user = UserDoc::new(1, None);
        assert!(!user.has_access(now));

        user.trial_end_date = Some(DateTime::from_chrono(now + Duration::hours(1)));
        assert!(user.has_active_trial(now));
        assert!(user.has_access(now));

        user.trial_end_date = Some(DateTime::from_chrono(now - Duration::hours(1)));
        user.subscription_end = Some(DateTime::from_chrono(now + Duration::days(30)));
        assert!(!user.has_active_trial(now));
        assert!(user.has_access(now));
    }

    #[test]
    fn test_key_round_trips_through_bson() {
        let mut user = UserDoc::new(42, Some("alice".into()));
        user.key = Some(binding());

        let doc = bson::to_document(&user).unwrap();
        assert_eq!(doc.get_document("key").unwrap().get_str("key_id").unwrap(), "7");

        let back: UserDoc = bson::from_document(doc).unwrap();
        assert_eq!(back.key_ref(), Some(KeyRef::new("h1", "7")));
        assert_eq!(back.key.unwrap().port, 31337);
    }

    #[test]
    fn test_unbound_user_omits_key() {
        let doc = bson::to_document(&UserDoc::new(42, None)).unwrap();
        assert!(!doc.contains_key("key"));
        assert!(!doc.contains_key("dynamic_key"));
    }

    #[test]
    fn test_key_ref_display() {
        assert_eq!(KeyRef::new("h1", "7").to_string(), "7@h1");
    }
}
