//! Loading per-version schema and transform modules.
//!
//! A module is addressed by its path inside a version directory. The
//! [`ModuleLoader`] capability decides whether a path holds a module and how to
//! materialise it; [`ModuleRegistry`] serves modules registered in-process and
//! falls back to YAML entity-manager files on disk.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::debug;

use crate::config::LayoutConfig;
use crate::entity::{EntityManager, SchemaManager};
use crate::error::Error;
use crate::transform::TransformMap;
use crate::version::{self, parse_version_token};

pub type SchemaFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn SchemaManager>>> + Send + Sync>;

/// A module's primary export: a ready instance or a factory producing one.
#[derive(Clone)]
pub enum ModuleExport {
    Instance(Arc<dyn SchemaManager>),
    Factory(SchemaFactory),
}

impl ModuleExport {
    pub fn instance(manager: impl SchemaManager + 'static) -> Self {
        ModuleExport::Instance(Arc::new(manager))
    }

    pub fn factory<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn SchemaManager>>> + Send + 'static,
    {
        ModuleExport::Factory(Arc::new(move || Box::pin(factory())))
    }
}

impl fmt::Debug for ModuleExport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleExport::Instance(manager) => f.debug_tuple("Instance").field(manager).finish(),
            ModuleExport::Factory(_) => f.write_str("Factory"),
        }
    }
}

#[async_trait]
pub trait ModuleLoader: Send + Sync {
    fn module_exists(&self, path: &Path) -> bool;

    async fn load_schema_module(&self, path: &Path) -> Result<ModuleExport>;

    async fn load_transform_module(&self, path: &Path) -> Result<TransformMap>;
}

/// In-process module table with an on-disk YAML fallback for schema modules.
#[derive(Default, Clone)]
pub struct ModuleRegistry {
    schemas: HashMap<PathBuf, ModuleExport>,
    transforms: HashMap<PathBuf, TransformMap>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_schema(&mut self, path: impl Into<PathBuf>, export: ModuleExport) -> &mut Self {
        self.schemas.insert(path.into(), export);
        self
    }

    pub fn register_transforms(&mut self, path: impl Into<PathBuf>, map: TransformMap) -> &mut Self {
        self.transforms.insert(path.into(), map);
        self
    }
}

#[async_trait]
impl ModuleLoader for ModuleRegistry {
    fn module_exists(&self, path: &Path) -> bool {
        self.schemas.contains_key(path) || self.transforms.contains_key(path) || path.is_file()
    }

    async fn load_schema_module(&self, path: &Path) -> Result<ModuleExport> {
        if let Some(export) = self.schemas.get(path) {
            return Ok(export.clone());
        }
        if !path.is_file() {
            return Err(Error::InvalidSchemaModule {
                path: path.to_path_buf(),
                reason: "module is neither registered nor present on disk".to_string(),
            }
            .into());
        }
        let manager = EntityManager::load(path).map_err(|err| Error::InvalidSchemaModule {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        })?;
        Ok(ModuleExport::instance(manager))
    }

    async fn load_transform_module(&self, path: &Path) -> Result<TransformMap> {
        self.transforms.get(path).cloned().ok_or_else(|| {
            Error::InvalidTransformModule {
                path: path.to_path_buf(),
                reason: "no transform handlers are registered for this module".to_string(),
            }
            .into()
        })
    }
}

/// Loads the schema manager exported at `path`, invoking a factory export.
pub async fn load_schema_manager(
    loader: &dyn ModuleLoader,
    path: &Path,
) -> Result<Arc<dyn SchemaManager>> {
    let manager = match loader.load_schema_module(path).await? {
        ModuleExport::Instance(manager) => manager,
        ModuleExport::Factory(factory) => factory().await.map_err(|err| {
            Error::InvalidSchemaModule {
                path: path.to_path_buf(),
                reason: format!("factory failed: {err:#}"),
            }
        })?,
    };
    manager
        .config()
        .validate()
        .map_err(|err| Error::InvalidSchemaModule {
            path: path.to_path_buf(),
            reason: format!("{err:#}"),
        })?;
    debug!("Loaded schema module {path:?}");
    Ok(manager)
}

/// Resolves the nearest schema module at or below `version` and loads it.
pub async fn resolve_and_load_schema_manager(
    version: &str,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
) -> Result<Arc<dyn SchemaManager>> {
    parse_version_token(version)?;
    let path = version::resolve_schema_module_with_fallback(version, layout, loader)?
        .ok_or_else(|| Error::NoSchemaModuleResolvable {
            version: version.to_string(),
            root: layout.tables_root.clone(),
        })?;
    load_schema_manager(loader, &path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityManagerConfig;
    use crate::error;
    use std::fs;

    const USER_MANAGER: &str = "entities:\n  user:\n    uniqueProperty: userId\n";

    #[tokio::test]
    async fn loads_yaml_module_from_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("entityManager.yml");
        fs::write(&path, USER_MANAGER).expect("write module");
        let registry = ModuleRegistry::new();
        assert!(registry.module_exists(&path));
        let manager = load_schema_manager(&registry, &path).await.expect("loaded");
        assert!(manager.config().entities.contains_key("user"));
    }

    #[tokio::test]
    async fn malformed_yaml_module_is_invalid() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("entityManager.yml");
        fs::write(&path, "hashKey: same\nrangeKey: same\n").expect("write module");
        let err = load_schema_manager(&ModuleRegistry::new(), &path)
            .await
            .unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(Error::InvalidSchemaModule { .. })
        ));
    }

    #[tokio::test]
    async fn factory_exports_are_invoked() {
        let path = PathBuf::from("/virtual/001/entityManager.yml");
        let mut registry = ModuleRegistry::new();
        registry.register_schema(
            &path,
            ModuleExport::factory(|| async {
                let config: EntityManagerConfig =
                    serde_yaml::from_str(USER_MANAGER).expect("config");
                let manager: Arc<dyn SchemaManager> =
                    Arc::new(EntityManager::new(config).expect("manager"));
                Ok(manager)
            }),
        );
        assert!(registry.module_exists(&path));
        let manager = load_schema_manager(&registry, &path).await.expect("loaded");
        assert_eq!(manager.config().hash_key, "hashKey");
    }

    #[tokio::test]
    async fn factory_failure_is_invalid_module() {
        let path = PathBuf::from("/virtual/002/entityManager.yml");
        let mut registry = ModuleRegistry::new();
        registry.register_schema(
            &path,
            ModuleExport::factory(|| async { Err(anyhow::anyhow!("boom")) }),
        );
        let err = load_schema_manager(&registry, &path).await.unwrap_err();
        assert!(err.to_string().contains("factory failed"));
    }

    #[tokio::test]
    async fn unregistered_transform_file_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("transform.yml");
        fs::write(&path, "user: drop\n").expect("write transform");
        let err = ModuleRegistry::new()
            .load_transform_module(&path)
            .await
            .unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(Error::InvalidTransformModule { .. })
        ));
    }

    #[tokio::test]
    async fn unresolvable_schema_reports_version() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join("000")).expect("mkdir");
        let layout = LayoutConfig::with_root(dir.path());
        let err = resolve_and_load_schema_manager("0", &layout, &ModuleRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(Error::NoSchemaModuleResolvable { .. })
        ));
    }
}
