#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use table_versioner::config::LayoutConfig;
use table_versioner::entity::{EntityManager, SchemaManager, StorageRecord};
use tempfile::{TempDir, tempdir};

/// Entity manager with a single unsharded `user` entity.
pub const USER_MANAGER: &str = "\
entities:
  user:
    uniqueProperty: userId
";

/// Adds an `order` entity and a generated property used by an index.
pub const USER_ORDER_MANAGER: &str = "\
entities:
  user:
    uniqueProperty: userId
  order:
    uniqueProperty: orderId
generatedProperties:
  unsharded:
    userEmail: [email]
indexes:
  byEmail:
    hashKey: hashKey
    rangeKey: userEmail
";

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent directories");
        }
        fs::write(&path, contents).expect("write temp file contents");
        path
    }

    pub fn tables_root(&self) -> PathBuf {
        self.path().join("tables")
    }

    pub fn layout(&self) -> LayoutConfig {
        LayoutConfig::with_root(self.tables_root())
    }

    /// Creates a version directory, optionally carrying an entity manager file.
    pub fn add_version(&self, token: &str, manager: Option<&str>) -> PathBuf {
        let dir = self.tables_root().join(token);
        fs::create_dir_all(&dir).expect("create version dir");
        if let Some(manager) = manager {
            fs::write(dir.join("entityManager.yml"), manager).expect("write entity manager");
        }
        dir
    }

    /// Writes records as a JSON-lines table dump.
    pub fn write_records(&self, name: &str, records: &[StorageRecord]) -> PathBuf {
        let body = records
            .iter()
            .map(|record| serde_json::to_string(record).expect("serialize record"))
            .map(|line| format!("{line}\n"))
            .collect::<String>();
        self.write(name, &body)
    }
}

pub fn manager(yaml: &str) -> EntityManager {
    EntityManager::new(serde_yaml::from_str(yaml).expect("parse manager config"))
        .expect("valid manager config")
}

pub fn item(value: Value) -> StorageRecord {
    value.as_object().cloned().expect("object literal")
}

/// A keyed `user` record as stored under `schema`.
pub fn user_record(schema: &dyn SchemaManager, id: &str, name: &str) -> StorageRecord {
    schema
        .add_keys("user", &item(json!({ "userId": id, "name": name })))
        .expect("add keys")
}
