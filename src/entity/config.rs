use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};

use super::Transcode;

const MAX_CHAR_BITS: u8 = 5;
const MAX_SHARD_CHARS: u8 = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardBump {
    pub timestamp: u64,
    pub char_bits: u8,
    pub chars: u8,
}

impl ShardBump {
    pub fn unsharded() -> Self {
        Self {
            timestamp: 0,
            char_bits: 1,
            chars: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConfig {
    pub unique_property: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_property: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shard_bumps: Vec<ShardBump>,
}

impl EntityConfig {
    /// The bump in force at `timestamp`; an entity without bumps is unsharded.
    pub fn active_bump(&self, timestamp: u64) -> ShardBump {
        self.shard_bumps
            .iter()
            .filter(|bump| bump.timestamp <= timestamp)
            .max_by_key(|bump| bump.timestamp)
            .cloned()
            .unwrap_or_else(ShardBump::unsharded)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratedProperties {
    pub sharded: BTreeMap<String, Vec<String>>,
    pub unsharded: BTreeMap<String, Vec<String>>,
}

impl GeneratedProperties {
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.sharded.keys().chain(self.unsharded.keys())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sharded.contains_key(name) || self.unsharded.contains_key(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    pub hash_key: String,
    pub range_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projections: Option<Vec<String>>,
}

/// Declarative schema-manager configuration, one per version directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EntityManagerConfig {
    pub hash_key: String,
    pub range_key: String,
    pub shard_key_delimiter: String,
    pub generated_key_delimiter: String,
    pub generated_value_delimiter: String,
    pub entities: BTreeMap<String, EntityConfig>,
    pub generated_properties: GeneratedProperties,
    pub indexes: BTreeMap<String, IndexConfig>,
    pub property_transcodes: BTreeMap<String, Transcode>,
}

impl Default for EntityManagerConfig {
    fn default() -> Self {
        Self {
            hash_key: "hashKey".to_string(),
            range_key: "rangeKey".to_string(),
            shard_key_delimiter: "!".to_string(),
            generated_key_delimiter: "|".to_string(),
            generated_value_delimiter: "#".to_string(),
            entities: BTreeMap::new(),
            generated_properties: GeneratedProperties::default(),
            indexes: BTreeMap::new(),
            property_transcodes: BTreeMap::new(),
        }
    }
}

impl EntityManagerConfig {
    pub fn transcode_for(&self, property: &str) -> Transcode {
        self.property_transcodes
            .get(property)
            .copied()
            .unwrap_or_default()
    }

    /// Names the storage-only fields `remove_keys` strips.
    pub fn storage_only_keys(&self) -> BTreeSet<&str> {
        let mut keys = BTreeSet::from([self.hash_key.as_str(), self.range_key.as_str()]);
        keys.extend(self.generated_properties.names().map(String::as_str));
        keys
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.hash_key.is_empty(), "hashKey cannot be empty");
        ensure!(!self.range_key.is_empty(), "rangeKey cannot be empty");
        ensure!(
            self.hash_key != self.range_key,
            "hashKey and rangeKey must differ (both '{}')",
            self.hash_key
        );
        for (label, delimiter) in [
            ("shardKeyDelimiter", &self.shard_key_delimiter),
            ("generatedKeyDelimiter", &self.generated_key_delimiter),
            ("generatedValueDelimiter", &self.generated_value_delimiter),
        ] {
            ensure!(!delimiter.is_empty(), "{label} cannot be empty");
        }
        ensure!(
            self.generated_key_delimiter != self.generated_value_delimiter,
            "generatedKeyDelimiter and generatedValueDelimiter must differ"
        );

        for (name, entity) in &self.entities {
            ensure!(
                !name.contains(self.shard_key_delimiter.as_str()),
                "Entity token '{name}' cannot contain the shard key delimiter '{}'",
                self.shard_key_delimiter
            );
            ensure!(
                !entity.unique_property.is_empty(),
                "Entity '{name}' must declare a uniqueProperty"
            );
            let mut seen = BTreeSet::new();
            for bump in &entity.shard_bumps {
                ensure!(
                    (1..=MAX_CHAR_BITS).contains(&bump.char_bits),
                    "Entity '{name}' shard bump charBits must be between 1 and {MAX_CHAR_BITS}"
                );
                ensure!(
                    bump.chars <= MAX_SHARD_CHARS,
                    "Entity '{name}' shard bump chars must be at most {MAX_SHARD_CHARS}"
                );
                ensure!(
                    seen.insert(bump.timestamp),
                    "Entity '{name}' declares two shard bumps at timestamp {}",
                    bump.timestamp
                );
            }
            if !entity.shard_bumps.is_empty() {
                ensure!(
                    entity.timestamp_property.is_some(),
                    "Entity '{name}' declares shard bumps without a timestampProperty"
                );
            }
        }

        let generated = &self.generated_properties;
        for (name, elements) in generated.sharded.iter().chain(generated.unsharded.iter()) {
            ensure!(
                !elements.is_empty(),
                "Generated property '{name}' must list at least one element"
            );
            ensure!(
                name != &self.hash_key && name != &self.range_key,
                "Generated property '{name}' collides with a table key"
            );
            if let Some(element) = elements.iter().find(|el| generated.contains(el)) {
                bail!("Generated property '{name}' cannot reference generated property '{element}'");
            }
        }
        if let Some(name) = generated
            .sharded
            .keys()
            .find(|name| generated.unsharded.contains_key(*name))
        {
            bail!("Generated property '{name}' is declared both sharded and unsharded");
        }

        for (name, index) in &self.indexes {
            for key in [&index.hash_key, &index.range_key] {
                ensure!(!key.is_empty(), "Index '{name}' has an empty key attribute");
            }
            ensure!(
                index.hash_key != index.range_key,
                "Index '{name}' hashKey and rangeKey must differ"
            );
            ensure!(
                index.hash_key == self.hash_key || generated.sharded.contains_key(&index.hash_key),
                "Index '{name}' hashKey '{}' must be the table hashKey or a sharded generated property",
                index.hash_key
            );
        }
        Ok(())
    }
}
