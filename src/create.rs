//! Create flow: gate on generated-section drift, overlay managed properties,
//! and hand the final table definition to a [`TableAdmin`].

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::config::LayoutConfig;
use crate::error::Error;
use crate::generated::{
    self, ManagedTableProperties, PROPERTIES, compute_generated_sections,
    refresh_generated_sections_in_place,
};
use crate::loader::{ModuleLoader, resolve_and_load_schema_manager};
use crate::version::resolve_version_directory;
use crate::yaml_provider;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableDefinition {
    pub table_name: String,
    pub properties: Map<String, Value>,
}

/// Control-plane collaborator that provisions a table.
#[async_trait]
pub trait TableAdmin: Send + Sync {
    async fn create_table(&self, definition: &TableDefinition) -> Result<()>;
}

/// Keeps every definition it is asked to create.
#[derive(Debug, Default)]
pub struct MemoryAdmin {
    created: Mutex<Vec<TableDefinition>>,
}

impl MemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn created(&self) -> Vec<TableDefinition> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl TableAdmin for MemoryAdmin {
    async fn create_table(&self, definition: &TableDefinition) -> Result<()> {
        self.created.lock().await.push(definition.clone());
        Ok(())
    }
}

/// Writes the definition as pretty JSON to a file, or stdout when no path is set.
#[derive(Debug, Clone, Default)]
pub struct DefinitionWriter {
    output: Option<PathBuf>,
}

impl DefinitionWriter {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }
}

#[async_trait]
impl TableAdmin for DefinitionWriter {
    async fn create_table(&self, definition: &TableDefinition) -> Result<()> {
        let rendered = serde_json::to_string_pretty(definition)?;
        match &self.output {
            Some(path) => fs::write(path, format!("{rendered}\n"))
                .with_context(|| format!("Writing table definition to {path:?}")),
            None => {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{rendered}").context("Writing table definition to stdout")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateTableOptions {
    pub version: String,
    /// Check generated sections against the schema before creating.
    pub validate: bool,
    /// Rewrite generated sections in place instead of validating them.
    pub refresh_generated: bool,
    /// Create even when validation finds drift.
    pub force: bool,
    pub managed: Option<ManagedTableProperties>,
    /// Overrides the `TableName` declared in the file.
    pub table_name: Option<String>,
}

impl CreateTableOptions {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            validate: true,
            refresh_generated: false,
            force: false,
            managed: None,
            table_name: None,
        }
    }
}

/// Creates the table declared for `options.version` and returns its name.
pub async fn create_table(
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
    admin: &dyn TableAdmin,
    options: &CreateTableOptions,
) -> Result<String> {
    if let Some(managed) = &options.managed {
        managed.validate()?;
    }
    let dir = resolve_version_directory(&options.version, &layout.tables_root, true)?;
    let table_path = layout.table_file(&dir.path);
    if !table_path.is_file() {
        bail!(
            "Version '{}' has no declarative table file (looked for {:?})",
            dir.token,
            layout.table_candidates(&dir.path)
        );
    }
    let manager = resolve_and_load_schema_manager(&dir.token, layout, loader).await?;
    let generated = compute_generated_sections(manager.as_ref());

    if options.refresh_generated {
        refresh_generated_sections_in_place(&table_path, &generated, options.managed.as_ref())?;
    } else if options.validate {
        let document = yaml_provider::load_document(&table_path)?;
        let report = generated::compare_sections(&document, &generated)?;
        if !report.equal {
            if !options.force {
                return Err(Error::DriftDetected {
                    path: table_path,
                    diffs: report.diffs,
                }
                .into());
            }
            warn!(
                "Creating from {table_path:?} despite {} drifted section(s)",
                report.diffs.len()
            );
        }
    }

    let mut properties = read_properties(&table_path)?;
    if let Some(managed) = &options.managed {
        managed.overlay_json(&mut properties);
    }
    if let Some(name) = &options.table_name {
        properties.insert("TableName".to_string(), Value::from(name.as_str()));
    }
    let table_name = properties
        .get("TableName")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            anyhow!("{table_path:?} declares no TableName; pass a table name override")
        })?;

    admin
        .create_table(&TableDefinition {
            table_name: table_name.clone(),
            properties,
        })
        .await
        .with_context(|| format!("Creating table '{table_name}'"))?;
    info!("Created table '{table_name}' from version '{}'", dir.token);
    Ok(table_name)
}

fn read_properties(table_path: &Path) -> Result<Map<String, Value>> {
    let document = yaml_provider::load_document(table_path)?;
    let node = yaml_provider::lookup(&document, &[PROPERTIES])
        .ok_or_else(|| anyhow!("{table_path:?} has no {PROPERTIES} mapping"))?;
    match serde_json::to_value(node)
        .with_context(|| format!("Converting {PROPERTIES} of {table_path:?} to JSON"))?
    {
        Value::Object(properties) => Ok(properties),
        other => bail!("{PROPERTIES} of {table_path:?} is not a mapping: {other}"),
    }
}
