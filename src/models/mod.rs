use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, fmt::Display};

pub mod activity_type;

pub use activity_type::{ActivityType, ActivityTypeSpec};

/// Identifier for a published post, in `author/permlink` form.
///
/// The same string is used as the document id in the search backend, so a
/// decrypted activity record can be joined against candidates without an
/// extra lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostId(pub String);

impl PostId {
    pub fn new(author: &str, permlink: &str) -> Self {
        Self(format!("{}/{}", author, permlink))
    }

    /// Extracts the post identifier from an activity's metadata object.
    ///
    /// Most activity types carry `author`/`permlink`; clickthrough events
    /// carry the target post under `target_author`/`target_permlink`.
    pub fn from_metadata(metadata: &Map<String, Value>) -> Option<Self> {
        let field = |key: &str| metadata.get(key).and_then(Value::as_str);

        if let (Some(author), Some(permlink)) = (field("author"), field("permlink")) {
            return Some(Self::new(author, permlink));
        }
        if let (Some(author), Some(permlink)) = (field("target_author"), field("target_permlink"))
        {
            return Some(Self::new(author, permlink));
        }
        None
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A post resolved for delivery to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorPermlink {
    pub author: String,
    pub permlink: String,
}

/// A registered client device. Immutable once written; only the hash of the
/// device key is ever stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Device {
    pub username: String,
    pub device_name: Option<String>,
    pub device_key_hash: String,
    pub memo_key: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user activity keypair binding. The private half is never persisted:
/// it is embedded once into `info_message`, sealed to the account's memo
/// key, and handed to the client at registration time.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActivityInfo {
    pub hashed_username: String,
    pub hashed_user_id: String,
    pub public_activity_key: String,
    pub info_message: String,
    pub memo_key: String,
}

/// The proof a device presents with each authenticated request, recovered
/// from a memo sealed by the server at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProof {
    pub device_key: String,
    pub created_at: DateTime<Utc>,
}

/// One stored per-user record (or group of records collapsed by
/// `metadata_id`), still in ciphertext form.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EncryptedRow {
    pub metadata_id: String,
    /// Base64 RSA-OAEP ciphertext of the filtered metadata JSON.
    pub metadata: String,
    /// Base64 RSA-OAEP ciphertext of the RFC 3339 creation timestamp.
    pub created: String,
    pub event_count: i64,
    pub rank: i64,
}

/// A per-user record after decryption, ready for scoring.
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub post_id: PostId,
    pub metadata: Value,
    pub event_count: i64,
    pub rank: i64,
    pub created: DateTime<Utc>,
}

/// Average event count per user for one post, across the anonymized
/// aggregate collection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostAverage {
    pub avg: f64,
    pub users: i64,
    pub total: i64,
}

/// A user's average event count across their own distinct posts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct PersonalAverage {
    pub avg: f64,
    pub posts: i64,
    pub total: i64,
}

/// Stored similarity vectors for one post, keyed by vector space (one text
/// embedding per detected language plus the image-embedding space).
pub type DocumentVectors = HashMap<String, Vec<f32>>;

/// Vector space name for image embeddings; never removed by language
/// filtering.
pub const IMAGE_SPACE: &str = "image";

/// Optional constraints on the assembled feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedFilter {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent_permlinks: Vec<String>,
    #[serde(default)]
    pub langs: Vec<String>,
}

impl FeedFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.parent_permlinks.is_empty() && self.langs.is_empty()
    }
}
