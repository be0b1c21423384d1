use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::yaml_provider;

const DEFAULT_EXTENSION: &str = "yml";

/// On-disk layout conventions: `<tablesRoot>/<versionToken>/{table,entityManager,transform}.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutConfig {
    pub tables_root: PathBuf,
    pub table_token: String,
    pub entity_manager_token: String,
    pub transform_token: String,
    pub table_extensions: Vec<String>,
    pub module_extensions: Vec<String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            tables_root: PathBuf::from("tables"),
            table_token: "table".to_string(),
            entity_manager_token: "entityManager".to_string(),
            transform_token: "transform".to_string(),
            table_extensions: vec![DEFAULT_EXTENSION.to_string(), "yaml".to_string()],
            module_extensions: vec![DEFAULT_EXTENSION.to_string(), "yaml".to_string()],
        }
    }
}

impl LayoutConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            tables_root: root.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let config: LayoutConfig = yaml_provider::load_from_path(path)
            .with_context(|| format!("Loading layout config from {path:?}"))?;
        config.ensure_valid()?;
        Ok(config)
    }

    pub fn ensure_valid(&self) -> Result<()> {
        for (label, token) in [
            ("tableToken", &self.table_token),
            ("entityManagerToken", &self.entity_manager_token),
            ("transformToken", &self.transform_token),
        ] {
            ensure!(!token.trim().is_empty(), "Layout {label} cannot be empty");
        }
        ensure!(
            !self.table_extensions.is_empty(),
            "Layout tableExtensions must list at least one extension"
        );
        ensure!(
            !self.module_extensions.is_empty(),
            "Layout moduleExtensions must list at least one extension"
        );
        Ok(())
    }

    pub fn table_candidates(&self, dir: &Path) -> Vec<PathBuf> {
        candidates(dir, &self.table_token, &self.table_extensions)
    }

    pub fn schema_module_candidates(&self, dir: &Path) -> Vec<PathBuf> {
        candidates(dir, &self.entity_manager_token, &self.module_extensions)
    }

    pub fn transform_module_candidates(&self, dir: &Path) -> Vec<PathBuf> {
        candidates(dir, &self.transform_token, &self.module_extensions)
    }

    /// First existing declarative table file in `dir`, else the preferred name.
    ///
    /// An empty `table_extensions` list falls back to `.yml`.
    pub fn table_file(&self, dir: &Path) -> PathBuf {
        let candidates = self.table_candidates(dir);
        candidates
            .iter()
            .find(|path| path.is_file())
            .or_else(|| candidates.first())
            .cloned()
            .unwrap_or_else(|| dir.join(format!("{}.{DEFAULT_EXTENSION}", self.table_token)))
    }
}

fn candidates(dir: &Path, token: &str, extensions: &[String]) -> Vec<PathBuf> {
    extensions
        .iter()
        .map(|ext| dir.join(format!("{token}.{ext}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: LayoutConfig =
            serde_yaml::from_str("tablesRoot: infra/tables\ntransformToken: migrate\n")
                .expect("parse layout");
        assert_eq!(config.tables_root, PathBuf::from("infra/tables"));
        assert_eq!(config.transform_token, "migrate");
        assert_eq!(config.entity_manager_token, "entityManager");
        assert_eq!(config.table_extensions, vec!["yml", "yaml"]);
    }

    #[test]
    fn empty_tokens_are_rejected() {
        let config = LayoutConfig {
            table_token: " ".to_string(),
            ..LayoutConfig::default()
        };
        let err = config.ensure_valid().unwrap_err();
        assert!(err.to_string().contains("tableToken"));
    }

    #[test]
    fn table_file_prefers_existing_extension() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("table.yaml"), "Type: x\n").expect("write");
        let config = LayoutConfig::default();
        assert_eq!(config.table_file(dir.path()), dir.path().join("table.yaml"));
        let empty = tempfile::tempdir().expect("temp dir");
        assert_eq!(config.table_file(empty.path()), empty.path().join("table.yml"));
    }

    #[test]
    fn table_file_without_extensions_uses_default_name() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = LayoutConfig {
            table_extensions: Vec::new(),
            ..LayoutConfig::default()
        };
        assert!(config.ensure_valid().is_err());
        assert_eq!(config.table_file(dir.path()), dir.path().join("table.yml"));
    }
}
