use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::config::split_api_key;

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub owner_id: String,
    pub key_hash: String,
    pub last_used: Option<DateTime<Utc>>,
}

/// Bearer keys mapped to the user that owns them. Only hashes are kept.
#[derive(Debug, Default)]
pub struct ApiKeyManager {
    keys_by_hash: RwLock<HashMap<String, ApiKey>>,
}

impl ApiKeyManager {
    pub fn new() -> Self {
        Self {
            keys_by_hash: RwLock::new(HashMap::new()),
        }
    }

    /// Build from `owner:key` entries; malformed entries are skipped.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        let manager = Self::new();
        for entry in entries {
            if let Some((owner, key)) = split_api_key(entry.as_ref()) {
                manager.insert_key(owner, key);
            }
        }
        manager
    }

    pub fn insert_key(&self, owner_id: &str, key: &str) {
        let key_hash = hash_key(key);
        let record = ApiKey {
            owner_id: owner_id.to_string(),
            key_hash: key_hash.clone(),
            last_used: None,
        };
        self.keys_by_hash.write().insert(key_hash, record);
    }

    /// Look up a key and stamp its use. The returned record still carries
    /// the previous `last_used`.
    pub fn validate_key(&self, key: &str) -> Option<ApiKey> {
        let key_hash = hash_key(key);
        let mut keys = self.keys_by_hash.write();
        let record = keys.get_mut(&key_hash)?;
        let previous = record.clone();
        record.last_used = Some(Utc::now());
        Some(previous)
    }
}

fn hash_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}
