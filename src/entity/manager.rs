use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{EntityConfig, EntityManagerConfig, LogicalItem, SchemaManager, StorageRecord};
use crate::error::Error;
use crate::yaml_provider;

const SHARD_ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// Schema manager driven entirely by an [`EntityManagerConfig`].
#[derive(Debug, Clone)]
pub struct EntityManager {
    config: EntityManagerConfig,
}

impl EntityManager {
    pub fn new(config: EntityManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config: EntityManagerConfig = yaml_provider::load_from_path(path)?;
        Self::new(config).with_context(|| format!("Validating entity manager config {path:?}"))
    }

    fn entity(&self, entity_token: &str) -> Result<&EntityConfig> {
        self.config.entities.get(entity_token).ok_or_else(|| {
            Error::UnknownEntity {
                entity: entity_token.to_string(),
            }
            .into()
        })
    }

    fn shard_key(
        &self,
        entity_token: &str,
        entity: &EntityConfig,
        item: &LogicalItem,
        unique: &str,
    ) -> Result<String> {
        let timestamp = match entity.timestamp_property.as_deref() {
            Some(property) => item.get(property).and_then(Value::as_u64).ok_or_else(|| {
                Error::MissingKeyComponent {
                    entity: entity_token.to_string(),
                    property: property.to_string(),
                }
            })?,
            None => 0,
        };
        let bump = entity.active_bump(timestamp);
        // chars * charBits is bounded by config validation to fit in one digest.
        let digest = Sha256::digest(unique.as_bytes());
        let radix_bits = usize::from(bump.char_bits);
        Ok((0..usize::from(bump.chars))
            .map(|position| {
                let start = position * radix_bits;
                let index = (start..start + radix_bits).fold(0usize, |acc, bit| {
                    let byte = digest[bit / 8];
                    (acc << 1) | usize::from((byte >> (7 - bit % 8)) & 1)
                });
                char::from(SHARD_ALPHABET[index])
            })
            .collect())
    }

    fn generated_value(&self, item: &LogicalItem, elements: &[String]) -> Result<Option<String>> {
        let mut parts = Vec::with_capacity(elements.len());
        for element in elements {
            let Some(value) = item.get(element).filter(|value| !value.is_null()) else {
                return Ok(None);
            };
            let encoded = self
                .config
                .transcode_for(element)
                .encode(value)
                .with_context(|| format!("Encoding property '{element}'"))?;
            parts.push(format!(
                "{element}{}{encoded}",
                self.config.generated_value_delimiter
            ));
        }
        Ok(Some(parts.join(&self.config.generated_key_delimiter)))
    }
}

impl SchemaManager for EntityManager {
    fn config(&self) -> &EntityManagerConfig {
        &self.config
    }

    fn remove_keys(&self, entity_token: &str, record: &StorageRecord) -> Result<LogicalItem> {
        self.entity(entity_token)?;
        let strip = self.config.storage_only_keys();
        Ok(record
            .iter()
            .filter(|(key, _)| !strip.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn add_keys(&self, entity_token: &str, item: &LogicalItem) -> Result<StorageRecord> {
        let entity = self.entity(entity_token)?;
        let missing = || Error::MissingKeyComponent {
            entity: entity_token.to_string(),
            property: entity.unique_property.clone(),
        };
        let unique_value = item.get(&entity.unique_property).ok_or_else(missing)?;
        let unique = self
            .config
            .transcode_for(&entity.unique_property)
            .encode(unique_value)
            .map_err(|_| missing())?;

        let shard = self.shard_key(entity_token, entity, item, &unique)?;
        let hash_value = format!("{entity_token}{}{shard}", self.config.shard_key_delimiter);
        let range_value = format!(
            "{}{}{unique}",
            entity.unique_property, self.config.generated_value_delimiter
        );

        let mut record = item.clone();
        for key in self.config.storage_only_keys() {
            record.remove(key);
        }
        for (name, elements) in &self.config.generated_properties.sharded {
            if let Some(value) = self.generated_value(item, elements)? {
                record.insert(
                    name.clone(),
                    Value::String(format!(
                        "{hash_value}{}{value}",
                        self.config.generated_key_delimiter
                    )),
                );
            }
        }
        for (name, elements) in &self.config.generated_properties.unsharded {
            if let Some(value) = self.generated_value(item, elements)? {
                record.insert(name.clone(), Value::String(value));
            }
        }
        record.insert(self.config.hash_key.clone(), Value::String(hash_value));
        record.insert(self.config.range_key.clone(), Value::String(range_value));
        Ok(record)
    }
}
