use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

pub use serde_yaml::Value as YamlValue;

pub trait YamlProvider: Send + Sync {
    fn parse_str(&self, input: &str) -> Result<YamlValue>;
    fn dump_value(&self, value: &YamlValue) -> Result<String>;
}

struct SerdeYamlProvider;

impl YamlProvider for SerdeYamlProvider {
    fn parse_str(&self, input: &str) -> Result<YamlValue> {
        if input.trim().is_empty() {
            return Ok(YamlValue::Null);
        }
        Ok(serde_yaml::from_str(input)?)
    }

    fn dump_value(&self, value: &YamlValue) -> Result<String> {
        Ok(serde_yaml::to_string(value)?)
    }
}

static YAML_PROVIDER: OnceLock<Box<dyn YamlProvider>> = OnceLock::new();

pub fn provider() -> &'static dyn YamlProvider {
    YAML_PROVIDER
        .get_or_init(|| Box::new(SerdeYamlProvider))
        .as_ref()
}

pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Reading YAML file {path:?}"))
}

/// Replaces `path` with `contents` by writing a sibling temp file and renaming it over.
pub fn write_string(path: &Path, contents: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let staging = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&staging, contents).with_context(|| format!("Writing YAML file {staging:?}"))?;
    fs::rename(&staging, path).with_context(|| format!("Replacing YAML file {path:?}"))?;
    Ok(())
}

pub fn parse_document(raw: &str) -> Result<YamlValue> {
    provider().parse_str(raw)
}

pub fn load_document(path: &Path) -> Result<YamlValue> {
    let raw = read_to_string(path)?;
    parse_document(&raw).with_context(|| format!("Parsing YAML file {path:?}"))
}

pub fn load_from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let value = load_document(path)?;
    serde_yaml::from_value(value).with_context(|| format!("Decoding YAML file {path:?}"))
}

/// Looks up a nested mapping node by key path.
pub fn lookup<'a>(document: &'a YamlValue, path: &[&str]) -> Option<&'a YamlValue> {
    path.iter()
        .try_fold(document, |node, key| node.as_mapping()?.get(*key))
}
