//! Version tokens and the versioned directory layout.
//!
//! Version directories live directly under the tables root and are named by a
//! digit-only token. Tokens order by numeric value, so `2`, `002`, and `0002`
//! all name the same version and may not coexist.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::config::LayoutConfig;
use crate::error::Error;
use crate::loader::ModuleLoader;

/// Largest integer exactly representable in an IEEE-754 double.
pub const MAX_SAFE_VERSION: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDirectory {
    pub token: String,
    pub value: u64,
    pub path: PathBuf,
}

impl VersionDirectory {
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }
}

pub fn parse_version_token(token: &str) -> Result<u64> {
    let invalid = || Error::InvalidVersionToken {
        token: token.to_string(),
    };
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid().into());
    }
    let value: u64 = token.parse().map_err(|_| invalid())?;
    if value > MAX_SAFE_VERSION {
        return Err(invalid().into());
    }
    Ok(value)
}

pub fn format_version_token(value: u64, min_width: usize) -> Result<String> {
    if min_width == 0 {
        return Err(Error::InvalidTokenWidth { width: min_width }.into());
    }
    Ok(format!("{value:0min_width$}"))
}

/// Lists version directories under `root`, ascending by numeric value.
///
/// Entries whose names are not digit-only are ignored; digit-only names past
/// the safe range are an error. A missing root yields an empty list.
pub fn list_version_directories(root: &Path) -> Result<Vec<VersionDirectory>> {
    if !root.is_dir() {
        debug!("Tables root {root:?} does not exist; no versions discovered");
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("Reading tables root {root:?}"))? {
        let entry = entry.with_context(|| format!("Reading entry under {root:?}"))?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.is_empty() || !name.bytes().all(|byte| byte.is_ascii_digit()) {
            continue;
        }
        let value = parse_version_token(&name)
            .with_context(|| format!("Version directory {:?}", entry.path()))?;
        found.push(VersionDirectory {
            token: name,
            value,
            path: entry.path(),
        });
    }
    found.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.token.cmp(&b.token)));
    if let Some(pair) = found.windows(2).find(|pair| pair[0].value == pair[1].value) {
        return Err(Error::DuplicateVersionDirectories {
            first: pair[0].token.clone(),
            second: pair[1].token.clone(),
            value: pair[0].value,
        }
        .into());
    }
    Ok(found)
}

/// Finds the directory encoding `version`.
///
/// When `must_exist` is false and nothing matches, a directory is synthesized
/// using the caller's token verbatim so it can be created later.
pub fn resolve_version_directory(
    version: &str,
    root: &Path,
    must_exist: bool,
) -> Result<VersionDirectory> {
    let value = parse_version_token(version)?;
    let directories = list_version_directories(root)?;
    if let Some(found) = directories.into_iter().find(|dir| dir.value == value) {
        return Ok(found);
    }
    if must_exist {
        return Err(Error::VersionDirectoryNotFound {
            version: version.to_string(),
            root: root.to_path_buf(),
        }
        .into());
    }
    Ok(VersionDirectory {
        token: version.to_string(),
        value,
        path: root.join(version),
    })
}

/// Locates the schema module for `version`, falling back to the nearest older
/// directory that carries one.
pub fn resolve_schema_module_with_fallback(
    version: &str,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
) -> Result<Option<PathBuf>> {
    let target = parse_version_token(version)?;
    let directories = list_version_directories(&layout.tables_root)?;
    for dir in directories.iter().rev().filter(|dir| dir.value <= target) {
        let hit = layout
            .schema_module_candidates(&dir.path)
            .into_iter()
            .find(|candidate| loader.module_exists(candidate));
        if let Some(path) = hit {
            if dir.value != target {
                debug!(
                    "Version '{version}' has no schema module; falling back to '{}'",
                    dir.token
                );
            }
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Locates the optional transform module inside a single version directory.
pub fn resolve_transform_module(
    dir: &VersionDirectory,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
) -> Option<PathBuf> {
    layout
        .transform_module_candidates(&dir.path)
        .into_iter()
        .find(|candidate| loader.module_exists(candidate))
}

/// Discovered directories with `from < value <= to`, ascending.
pub fn enumerate_step_versions(
    from_version: &str,
    to_version: &str,
    root: &Path,
) -> Result<Vec<VersionDirectory>> {
    let from = parse_version_token(from_version)?;
    let to = parse_version_token(to_version)?;
    if to <= from {
        return Err(Error::InvalidVersionRange {
            from: from_version.to_string(),
            to: to_version.to_string(),
        }
        .into());
    }
    Ok(list_version_directories(root)?
        .into_iter()
        .filter(|dir| dir.value > from && dir.value <= to)
        .collect())
}

/// Width to use for a new token: the widest existing token, at least one.
pub fn preferred_token_width(root: &Path) -> Result<usize> {
    Ok(list_version_directories(root)?
        .iter()
        .map(|dir| dir.token.len())
        .max()
        .unwrap_or(1))
}
