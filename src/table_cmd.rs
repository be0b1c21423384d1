//! Command entries for listing, validating, generating, scaffolding, and
//! creating versioned tables.

use std::fs;
use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use similar::TextDiff;

use crate::cli::{CreateArgs, GenerateArgs, ScaffoldArgs, ValidateArgs};
use crate::config::LayoutConfig;
use crate::create::{self, CreateTableOptions, DefinitionWriter};
use crate::error::Error;
use crate::generated::{
    self, ManagedTableProperties, SectionDiff, compose_new_table_yaml,
    compute_generated_sections, refresh_generated_sections_in_place,
};
use crate::loader::{ModuleLoader, ModuleRegistry, resolve_and_load_schema_manager};
use crate::version::{
    self, VersionDirectory, format_version_token, list_version_directories,
    parse_version_token, preferred_token_width, resolve_version_directory,
};

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Starting async runtime")?;
    Ok(runtime.block_on(future))
}

pub fn list_versions(layout: &LayoutConfig) -> Result<()> {
    let loader = ModuleRegistry::new();
    let directories = list_version_directories(&layout.tables_root)?;
    if directories.is_empty() {
        warn!("No version directories under {:?}", layout.tables_root);
        return Ok(());
    }
    for dir in &directories {
        let schema = version::resolve_schema_module_with_fallback(&dir.token, layout, &loader)?
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        let table = layout.table_file(&dir.path);
        let table = if table.is_file() {
            table.display().to_string()
        } else {
            "-".to_string()
        };
        println!("{}\tschema: {schema}\ttable: {table}", dir.token);
    }
    Ok(())
}

fn render_section_diff(diff: &SectionDiff) -> Result<String> {
    let expected = serde_yaml::to_string(&diff.expected)?;
    let actual = serde_yaml::to_string(&diff.actual)?;
    let text_diff = TextDiff::from_lines(&actual, &expected);
    Ok(text_diff
        .unified_diff()
        .context_radius(3)
        .header(
            &format!("declared {}", diff.key),
            &format!("generated {}", diff.key),
        )
        .to_string())
}

pub fn validate(args: &ValidateArgs, layout: &LayoutConfig) -> Result<()> {
    let loader = ModuleRegistry::new();
    let directories = match &args.version {
        Some(version) => vec![resolve_version_directory(version, &layout.tables_root, true)?],
        None => list_version_directories(&layout.tables_root)?
            .into_iter()
            .filter(|dir| layout.table_file(&dir.path).is_file())
            .collect(),
    };

    let mut drifted = Vec::new();
    for dir in &directories {
        let table_path = layout.table_file(&dir.path);
        let manager = block_on(resolve_and_load_schema_manager(&dir.token, layout, &loader))??;
        let report = generated::validate_generated_sections(&table_path, manager.as_ref())
            .with_context(|| format!("Validating {table_path:?}"))?;
        if report.equal {
            info!("✓ {table_path:?} matches the generated sections");
            continue;
        }
        for diff in &report.diffs {
            print!("{}", render_section_diff(diff)?);
        }
        drifted.push((table_path, report.diffs));
    }

    match drifted.len() {
        0 => Ok(()),
        1 => {
            let (path, diffs) = drifted.remove(0);
            Err(Error::DriftDetected { path, diffs }.into())
        }
        count => bail!(
            "{count} table files drifted from their schema: {}",
            drifted
                .iter()
                .map(|(path, _)| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Refreshes the table file of an existing version, composing it from the
/// nearest older table file when it does not exist yet.
pub async fn generate_version(
    version: &str,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
    managed: Option<&ManagedTableProperties>,
) -> Result<PathBuf> {
    let dir = resolve_version_directory(version, &layout.tables_root, true)?;
    let manager = resolve_and_load_schema_manager(&dir.token, layout, loader).await?;
    let sections = compute_generated_sections(manager.as_ref());
    let table_path = layout.table_file(&dir.path);
    if table_path.is_file() {
        refresh_generated_sections_in_place(&table_path, &sections, managed)?;
    } else {
        let baseline = nearest_older_table(&dir, layout)?;
        compose_new_table_yaml(&table_path, baseline.as_deref(), &sections, managed)?;
    }
    Ok(table_path)
}

/// Creates `<root>/<token>/` with a composed table file and returns the new directory.
///
/// The token is zero-padded to `width`, or to the widest existing token.
pub async fn scaffold_version(
    version: &str,
    width: Option<usize>,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
    managed: Option<&ManagedTableProperties>,
) -> Result<VersionDirectory> {
    if let Some(managed) = managed {
        managed.validate()?;
    }
    let value = parse_version_token(version)?;
    if let Some(existing) = list_version_directories(&layout.tables_root)?
        .into_iter()
        .find(|dir| dir.value == value)
    {
        bail!(
            "Version {value} already exists at {:?}",
            existing.path
        );
    }
    let width = match width {
        Some(width) => width,
        None => preferred_token_width(&layout.tables_root)?,
    };
    let token = format_version_token(value, width)?;
    let dir = VersionDirectory {
        path: layout.tables_root.join(&token),
        token,
        value,
    };

    // Resolve before touching the filesystem so a missing schema leaves no directory behind.
    let manager = resolve_and_load_schema_manager(&dir.token, layout, loader).await?;
    let sections = compute_generated_sections(manager.as_ref());
    let baseline = nearest_older_table(&dir, layout)?;

    fs::create_dir_all(&dir.path)
        .with_context(|| format!("Creating version directory {:?}", dir.path))?;
    let table_path = layout.table_file(&dir.path);
    compose_new_table_yaml(&table_path, baseline.as_deref(), &sections, managed)?;
    info!(
        "Scaffolded version '{}' at {:?}{}",
        dir.token,
        dir.path,
        baseline
            .map(|path| format!(" from {path:?}"))
            .unwrap_or_default()
    );
    Ok(dir)
}

fn nearest_older_table(dir: &VersionDirectory, layout: &LayoutConfig) -> Result<Option<PathBuf>> {
    Ok(list_version_directories(&layout.tables_root)?
        .iter()
        .rev()
        .filter(|candidate| candidate.value < dir.value)
        .map(|candidate| layout.table_file(&candidate.path))
        .find(|path| path.is_file()))
}

pub fn generate(args: &GenerateArgs, layout: &LayoutConfig) -> Result<()> {
    let loader = ModuleRegistry::new();
    let managed = args.managed.to_managed();
    let path = block_on(generate_version(
        &args.version,
        layout,
        &loader,
        managed.as_ref(),
    ))??;
    info!("Generated sections up to date in {path:?}");
    Ok(())
}

pub fn scaffold(args: &ScaffoldArgs, layout: &LayoutConfig) -> Result<()> {
    let loader = ModuleRegistry::new();
    let managed = args.managed.to_managed();
    let dir = block_on(scaffold_version(
        &args.version,
        args.width,
        layout,
        &loader,
        managed.as_ref(),
    ))??;
    println!("{}", dir.path.display());
    Ok(())
}

pub fn create(args: &CreateArgs, layout: &LayoutConfig) -> Result<()> {
    let loader = ModuleRegistry::new();
    let admin = DefinitionWriter::new(args.output.clone());
    let mut options = CreateTableOptions::new(&args.version);
    options.validate = !args.skip_validation;
    options.refresh_generated = args.refresh_generated;
    options.force = args.force;
    options.managed = args.managed.to_managed();
    options.table_name = args.table_name_override.clone();
    let table_name = block_on(create::create_table(layout, &loader, &admin, &options))??;
    info!("Resolved definition for table '{table_name}'");
    Ok(())
}
