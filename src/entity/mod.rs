//! Logical schema for one version: storage key layout, generated properties,
//! secondary indexes, and the key add/remove operations that move items
//! between their storage and logical shapes.

pub mod config;
pub mod manager;
pub mod transcode;

use std::fmt;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::error::Error;

pub use config::{
    EntityConfig, EntityManagerConfig, GeneratedProperties, IndexConfig, ShardBump,
};
pub use manager::EntityManager;
pub use transcode::Transcode;

/// A row as persisted, including storage-only key fields.
pub type StorageRecord = Map<String, Value>;

/// A row with storage-only key fields stripped.
pub type LogicalItem = Map<String, Value>;

/// The per-version schema capability consumed by the migration chain and the
/// generated-schema tooling.
pub trait SchemaManager: Send + Sync + fmt::Debug {
    fn config(&self) -> &EntityManagerConfig;

    fn remove_keys(&self, entity_token: &str, record: &StorageRecord) -> Result<LogicalItem>;

    fn add_keys(&self, entity_token: &str, item: &LogicalItem) -> Result<StorageRecord>;
}

/// Reads the entity token off the front of a record's hash-key value.
pub fn extract_entity_token(config: &EntityManagerConfig, record: &StorageRecord) -> Result<String> {
    let raw = record.get(&config.hash_key);
    let failure = || Error::EntityTokenExtractionFailed {
        hash_key: config.hash_key.clone(),
        value: raw.map(Value::to_string).unwrap_or_else(|| "<missing>".to_string()),
        delimiter: config.shard_key_delimiter.clone(),
    };
    let value = raw.and_then(Value::as_str).ok_or_else(failure)?;
    let (token, _) = value
        .split_once(config.shard_key_delimiter.as_str())
        .ok_or_else(failure)?;
    Ok(token.to_string())
}

/// True when `record` carries both storage key fields of `config`.
pub fn has_storage_keys(config: &EntityManagerConfig, record: &StorageRecord) -> bool {
    record.contains_key(&config.hash_key) && record.contains_key(&config.range_key)
}

/// Renders a scalar the way key components are written when no transcode applies.
pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error;
    use serde_json::json;

    fn record(value: Value) -> StorageRecord {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn entity_token_is_prefix_before_delimiter() {
        let config = EntityManagerConfig::default();
        let token = extract_entity_token(&config, &record(json!({"hashKey": "user!0a"})))
            .expect("token");
        assert_eq!(token, "user");
        let token = extract_entity_token(&config, &record(json!({"hashKey": "email!"})))
            .expect("token");
        assert_eq!(token, "email");
    }

    #[test]
    fn entity_token_fails_without_delimiter() {
        let config = EntityManagerConfig::default();
        for item in [json!({"hashKey": "user"}), json!({"hashKey": 7}), json!({})] {
            let err = extract_entity_token(&config, &record(item)).unwrap_err();
            assert!(matches!(
                error::kind(&err),
                Some(Error::EntityTokenExtractionFailed { .. })
            ));
        }
    }
}
