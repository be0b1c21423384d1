//! Physical table sections derived from a schema manager, and drift checks
//! against the hand-maintained declarative table file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entity::SchemaManager;
use crate::error::Error;
use crate::yaml_edit::YamlDocument;
use crate::yaml_provider::{self, YamlValue};

pub const PROPERTIES: &str = "Properties";

const DEFAULT_TABLE_TEMPLATE: &str = "\
# Declarative table definition.
# AttributeDefinitions, KeySchema, and GlobalSecondaryIndexes are generated
# from the entity manager; edit everything else freely.
Type: AWS::DynamoDB::Table
Properties:
  BillingMode: PAY_PER_REQUEST
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GeneratedSection {
    AttributeDefinitions,
    KeySchema,
    GlobalSecondaryIndexes,
}

impl GeneratedSection {
    pub const ALL: [GeneratedSection; 3] = [
        GeneratedSection::AttributeDefinitions,
        GeneratedSection::KeySchema,
        GeneratedSection::GlobalSecondaryIndexes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratedSection::AttributeDefinitions => "AttributeDefinitions",
            GeneratedSection::KeySchema => "KeySchema",
            GeneratedSection::GlobalSecondaryIndexes => "GlobalSecondaryIndexes",
        }
    }
}

impl fmt::Display for GeneratedSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttributeDefinition {
    pub attribute_name: String,
    pub attribute_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KeySchemaElement {
    pub attribute_name: String,
    pub key_type: String,
}

impl KeySchemaElement {
    fn pair(hash_key: &str, range_key: &str) -> Vec<Self> {
        vec![
            KeySchemaElement {
                attribute_name: hash_key.to_string(),
                key_type: "HASH".to_string(),
            },
            KeySchemaElement {
                attribute_name: range_key.to_string(),
                key_type: "RANGE".to_string(),
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Projection {
    pub projection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_key_attributes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GlobalSecondaryIndex {
    pub index_name: String,
    pub key_schema: Vec<KeySchemaElement>,
    pub projection: Projection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSections {
    pub attribute_definitions: Vec<AttributeDefinition>,
    pub key_schema: Vec<KeySchemaElement>,
    pub global_secondary_indexes: Vec<GlobalSecondaryIndex>,
}

impl GeneratedSections {
    pub fn section_json(&self, section: GeneratedSection) -> Result<JsonValue> {
        let value = match section {
            GeneratedSection::AttributeDefinitions => serde_json::to_value(&self.attribute_definitions),
            GeneratedSection::KeySchema => serde_json::to_value(&self.key_schema),
            GeneratedSection::GlobalSecondaryIndexes => {
                serde_json::to_value(&self.global_secondary_indexes)
            }
        };
        value.with_context(|| format!("Serializing generated {section}"))
    }

    pub fn section_yaml(&self, section: GeneratedSection) -> Result<YamlValue> {
        serde_yaml::to_value(self.section_json(section)?)
            .with_context(|| format!("Converting generated {section} to YAML"))
    }
}

/// Derives the generated sections; output order is independent of map order.
pub fn compute_generated_sections(manager: &dyn SchemaManager) -> GeneratedSections {
    let config = manager.config();
    let mut attributes = BTreeMap::new();
    let mut define = |name: &str| {
        let attribute_type = if name == config.hash_key
            || name == config.range_key
            || config.generated_properties.contains(name)
        {
            "S"
        } else {
            config.transcode_for(name).attribute_type()
        };
        attributes.insert(name.to_string(), attribute_type.to_string());
    };
    define(&config.hash_key);
    define(&config.range_key);
    for index in config.indexes.values() {
        define(&index.hash_key);
        define(&index.range_key);
    }

    let global_secondary_indexes = config
        .indexes
        .iter()
        .map(|(name, index)| {
            let projection = match &index.projections {
                None => Projection {
                    projection_type: "ALL".to_string(),
                    non_key_attributes: None,
                },
                Some(list) if list.is_empty() => Projection {
                    projection_type: "KEYS_ONLY".to_string(),
                    non_key_attributes: None,
                },
                Some(list) => Projection {
                    projection_type: "INCLUDE".to_string(),
                    non_key_attributes: Some(
                        list.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect(),
                    ),
                },
            };
            GlobalSecondaryIndex {
                index_name: name.clone(),
                key_schema: KeySchemaElement::pair(&index.hash_key, &index.range_key),
                projection,
            }
        })
        .collect();

    GeneratedSections {
        attribute_definitions: attributes
            .into_iter()
            .map(|(attribute_name, attribute_type)| AttributeDefinition {
                attribute_name,
                attribute_type,
            })
            .collect(),
        key_schema: KeySchemaElement::pair(&config.hash_key, &config.range_key),
        global_secondary_indexes,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionDiff {
    pub key: GeneratedSection,
    pub expected: JsonValue,
    pub actual: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub equal: bool,
    pub diffs: Vec<SectionDiff>,
}

/// Reads one generated section from a parsed table document.
///
/// An absent `GlobalSecondaryIndexes` node reads as an empty list.
pub fn read_section(document: &YamlValue, section: GeneratedSection) -> Result<JsonValue> {
    match yaml_provider::lookup(document, &[PROPERTIES, section.as_str()]) {
        Some(node) => serde_json::to_value(node)
            .with_context(|| format!("Converting declared {section} to JSON")),
        None if section == GeneratedSection::GlobalSecondaryIndexes => Ok(JsonValue::Array(Vec::new())),
        None => Ok(JsonValue::Null),
    }
}

pub fn compare_sections(document: &YamlValue, generated: &GeneratedSections) -> Result<ValidationReport> {
    let mut diffs = Vec::new();
    for section in GeneratedSection::ALL {
        let expected = generated.section_json(section)?;
        let actual = read_section(document, section)?;
        if expected != actual {
            diffs.push(SectionDiff {
                key: section,
                expected,
                actual,
            });
        }
    }
    Ok(ValidationReport {
        equal: diffs.is_empty(),
        diffs,
    })
}

pub fn validate_generated_sections(
    table_path: &Path,
    manager: &dyn SchemaManager,
) -> Result<ValidationReport> {
    let document = yaml_provider::load_document(table_path)?;
    let report = compare_sections(&document, &compute_generated_sections(manager))?;
    debug!(
        "Validated {table_path:?}: {} drifted section(s)",
        report.diffs.len()
    );
    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[value(rename_all = "kebab-case")]
pub enum BillingMode {
    Provisioned,
    PayPerRequest,
}

impl BillingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingMode::Provisioned => "PROVISIONED",
            BillingMode::PayPerRequest => "PAY_PER_REQUEST",
        }
    }
}

/// Non-generated properties tooling may own when explicitly declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedTableProperties {
    pub billing_mode: Option<BillingMode>,
    pub read_capacity_units: Option<u64>,
    pub write_capacity_units: Option<u64>,
    pub table_name: Option<String>,
}

impl ManagedTableProperties {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        let violation = |reason: &str| -> Result<()> {
            Err(Error::ManagedPropertyInvariantViolation(reason.to_string()).into())
        };
        let throughput = match (self.read_capacity_units, self.write_capacity_units) {
            (Some(_), Some(_)) => true,
            (None, None) => false,
            _ => {
                return violation(
                    "read and write capacity units must be declared together",
                );
            }
        };
        match (throughput, self.billing_mode) {
            (true, None) => violation(
                "provisioned throughput requires billing mode to be declared as PROVISIONED",
            ),
            (true, Some(BillingMode::PayPerRequest)) => violation(
                "provisioned throughput cannot be declared with PAY_PER_REQUEST billing",
            ),
            _ => Ok(()),
        }
    }

    fn throughput_yaml(&self) -> Option<YamlValue> {
        let (read, write) = (self.read_capacity_units?, self.write_capacity_units?);
        let mut mapping = serde_yaml::Mapping::new();
        mapping.insert("ReadCapacityUnits".into(), read.into());
        mapping.insert("WriteCapacityUnits".into(), write.into());
        Some(YamlValue::Mapping(mapping))
    }

    /// Applies the declared values to an in-memory `Properties` object.
    pub fn overlay_json(&self, properties: &mut serde_json::Map<String, JsonValue>) {
        if let Some(mode) = self.billing_mode {
            properties.insert("BillingMode".to_string(), JsonValue::from(mode.as_str()));
            if mode == BillingMode::PayPerRequest {
                properties.remove("ProvisionedThroughput");
            }
        }
        if let (Some(read), Some(write)) = (self.read_capacity_units, self.write_capacity_units) {
            properties.insert(
                "ProvisionedThroughput".to_string(),
                serde_json::json!({ "ReadCapacityUnits": read, "WriteCapacityUnits": write }),
            );
        }
        if let Some(name) = &self.table_name {
            properties.insert("TableName".to_string(), JsonValue::from(name.as_str()));
        }
    }
}

fn apply_generated(document: &mut YamlDocument, generated: &GeneratedSections) -> Result<()> {
    for section in GeneratedSection::ALL {
        if section == GeneratedSection::GlobalSecondaryIndexes
            && generated.global_secondary_indexes.is_empty()
        {
            document.remove(PROPERTIES, section.as_str())?;
            continue;
        }
        document.set(PROPERTIES, section.as_str(), &generated.section_yaml(section)?)?;
    }
    Ok(())
}

fn apply_managed(document: &mut YamlDocument, managed: &ManagedTableProperties) -> Result<()> {
    if let Some(mode) = managed.billing_mode {
        document.set(PROPERTIES, "BillingMode", &YamlValue::from(mode.as_str()))?;
        if mode == BillingMode::PayPerRequest {
            document.remove(PROPERTIES, "ProvisionedThroughput")?;
        }
    }
    if let Some(throughput) = managed.throughput_yaml() {
        document.set(PROPERTIES, "ProvisionedThroughput", &throughput)?;
    }
    if let Some(name) = &managed.table_name {
        document.set(PROPERTIES, "TableName", &YamlValue::from(name.as_str()))?;
    }
    Ok(())
}

/// Applies generated (and optionally managed) nodes to `document`, then
/// confirms the result reads back as the generated sections.
fn render_document(
    mut document: YamlDocument,
    generated: &GeneratedSections,
    managed: Option<&ManagedTableProperties>,
) -> Result<String> {
    apply_generated(&mut document, generated)?;
    if let Some(managed) = managed {
        apply_managed(&mut document, managed)?;
    }
    let report = compare_sections(&document.value()?, generated)?;
    if !report.equal {
        bail!(
            "Rewritten document does not read back as the generated sections: {:?}",
            report.diffs.iter().map(|diff| diff.key).collect::<Vec<_>>()
        );
    }
    Ok(document.into_text())
}

/// Rewrites only the generated nodes (and declared managed properties) of an
/// existing declarative file.
pub fn refresh_generated_sections_in_place(
    table_path: &Path,
    generated: &GeneratedSections,
    managed: Option<&ManagedTableProperties>,
) -> Result<bool> {
    if let Some(managed) = managed {
        managed.validate()?;
    }
    let document = YamlDocument::load(table_path)?;
    let original = document.text().to_string();
    let updated = render_document(document, generated, managed)?;
    if updated == original {
        debug!("{table_path:?} already matches the generated sections");
        return Ok(false);
    }
    yaml_provider::write_string(table_path, &updated)?;
    info!("Refreshed generated sections in {table_path:?}");
    Ok(true)
}

/// Creates a new declarative file from `baseline` (or the default template).
pub fn compose_new_table_yaml(
    table_path: &Path,
    baseline: Option<&Path>,
    generated: &GeneratedSections,
    managed: Option<&ManagedTableProperties>,
) -> Result<()> {
    if let Some(managed) = managed {
        managed.validate()?;
    }
    if table_path.exists() {
        bail!("Refusing to overwrite existing table file {table_path:?}");
    }
    let document = match baseline {
        Some(template) => YamlDocument::load(template)
            .with_context(|| format!("Loading baseline template {template:?}"))?,
        None => YamlDocument::parse(DEFAULT_TABLE_TEMPLATE, table_path)?,
    };
    let rendered = render_document(document, generated, managed)?;
    if let Some(parent) = table_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Creating directory {parent:?}"))?;
    }
    yaml_provider::write_string(table_path, &rendered)?;
    info!("Composed table file {table_path:?}");
    Ok(())
}
