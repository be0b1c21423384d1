//! Step contexts and the per-record transform chain.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info};

use crate::config::LayoutConfig;
use crate::entity::{SchemaManager, StorageRecord, extract_entity_token, has_storage_keys};
use crate::error::Error;
use crate::loader::{ModuleLoader, resolve_and_load_schema_manager};
use crate::transform::{TransformContext, TransformMap};
use crate::version::{self, VersionDirectory};

/// Everything needed to move a record from the previous version into `version`.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub version: String,
    pub prev: Arc<dyn SchemaManager>,
    pub next: Arc<dyn SchemaManager>,
    pub transforms: TransformMap,
}

/// Builds one context per step directory in `(from, to]`, loading every module up front.
pub async fn build_step_contexts(
    from_version: &str,
    to_version: &str,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
) -> Result<Vec<StepContext>> {
    let steps = version::enumerate_step_versions(from_version, to_version, &layout.tables_root)?;
    info!(
        "Migration {from_version} -> {to_version} spans {} step(s): [{}]",
        steps.len(),
        steps
            .iter()
            .map(|dir| dir.token.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut contexts = Vec::with_capacity(steps.len());
    let mut prev_hint = from_version.to_string();
    for dir in &steps {
        contexts.push(build_step_context(&prev_hint, dir, layout, loader).await?);
        prev_hint = dir.token.clone();
    }
    Ok(contexts)
}

async fn build_step_context(
    prev_hint: &str,
    dir: &VersionDirectory,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
) -> Result<StepContext> {
    let prev = resolve_and_load_schema_manager(prev_hint, layout, loader)
        .await
        .with_context(|| format!("Loading previous schema for step '{}'", dir.token))?;
    let next = resolve_and_load_schema_manager(&dir.token, layout, loader)
        .await
        .with_context(|| format!("Loading next schema for step '{}'", dir.token))?;
    let transforms = match version::resolve_transform_module(dir, layout, loader) {
        Some(path) => {
            let map = loader.load_transform_module(&path).await?;
            debug!(
                "Step '{}' transforms {:?} from {path:?}",
                dir.token,
                map.entities().collect::<Vec<_>>()
            );
            map
        }
        None => TransformMap::new(),
    };
    Ok(StepContext {
        version: dir.token.clone(),
        prev,
        next,
        transforms,
    })
}

/// Applies a single step to one record.
pub async fn apply_step(record: StorageRecord, step: &StepContext) -> Result<Vec<StorageRecord>> {
    let entity_token = extract_entity_token(step.prev.config(), &record)?;
    let context = TransformContext {
        prev: step.prev.as_ref(),
        next: step.next.as_ref(),
        entity_token: &entity_token,
        version: &step.version,
    };

    let Some(handler) = step.transforms.get(&entity_token) else {
        return Ok(vec![context.default_chain(&record)?]);
    };

    let items = handler
        .transform(record, &context)
        .await
        .with_context(|| {
            format!(
                "Transform for entity '{entity_token}' failed at version '{}'",
                step.version
            )
        })?
        .into_items();

    let next_config = step.next.config();
    items
        .into_iter()
        .map(|item| {
            if has_storage_keys(next_config, &item) {
                let output_token = extract_entity_token(next_config, &item)?;
                if output_token != entity_token {
                    return Err(Error::CrossEntityFanOutNotSupported {
                        version: step.version.clone(),
                        input: entity_token.clone(),
                        output: output_token,
                    }
                    .into());
                }
                Ok(item)
            } else {
                step.next.add_keys(&entity_token, &item)
            }
        })
        .collect()
}

/// Folds `record` through every step in order; the output set of one step is
/// the input set of the next.
pub async fn apply_step_chain(
    record: StorageRecord,
    steps: &[StepContext],
) -> Result<Vec<StorageRecord>> {
    let mut current = vec![record];
    for step in steps {
        let mut produced = Vec::with_capacity(current.len());
        for record in current {
            produced.extend(apply_step(record, step).await?);
        }
        current = produced;
        if current.is_empty() {
            break;
        }
    }
    Ok(current)
}
