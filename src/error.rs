//! Typed failures raised by the layout resolver, loaders, chain applier, and
//! generated-schema tooling.
//!
//! Public operations return `anyhow::Result`; these variants sit at the root of
//! the chain so callers can recover them with `err.downcast_ref::<Error>()`.

use std::path::PathBuf;

use itertools::Itertools;
use thiserror::Error;

use crate::generated::SectionDiff;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid version token '{token}': expected digits only within the safe integer range")]
    InvalidVersionToken { token: String },

    #[error("Invalid version token width {width}: width must be a positive integer")]
    InvalidTokenWidth { width: usize },

    #[error(
        "Duplicate version directories '{first}' and '{second}' both encode version {value}"
    )]
    DuplicateVersionDirectories {
        first: String,
        second: String,
        value: u64,
    },

    #[error("Version directory for '{version}' not found under {root:?}")]
    VersionDirectoryNotFound { version: String, root: PathBuf },

    #[error("Invalid version range: to-version '{to}' must be greater than from-version '{from}'")]
    InvalidVersionRange { from: String, to: String },

    #[error("Invalid schema module {path:?}: {reason}")]
    InvalidSchemaModule { path: PathBuf, reason: String },

    #[error("No schema module resolvable for version '{version}' or any older version under {root:?}")]
    NoSchemaModuleResolvable { version: String, root: PathBuf },

    #[error("Invalid transform module {path:?}: {reason}")]
    InvalidTransformModule { path: PathBuf, reason: String },

    #[error(
        "Cannot extract entity token: '{hash_key}' value {value} does not contain shard delimiter '{delimiter}'"
    )]
    EntityTokenExtractionFailed {
        hash_key: String,
        value: String,
        delimiter: String,
    },

    #[error("Unknown entity '{entity}'")]
    UnknownEntity { entity: String },

    #[error("Entity '{entity}' item is missing key component '{property}'")]
    MissingKeyComponent { entity: String, property: String },

    #[error(
        "Transform at version '{version}' turned a '{input}' record into a '{output}' record; cross-entity fan-out is not supported"
    )]
    CrossEntityFanOutNotSupported {
        version: String,
        input: String,
        output: String,
    },

    #[error("Managed table properties are inconsistent: {0}")]
    ManagedPropertyInvariantViolation(String),

    #[error(
        "Generated sections in {path:?} drifted from the schema ({}); refresh them or pass --force",
        .diffs.iter().map(|diff| diff.key.as_str()).join(", ")
    )]
    DriftDetected {
        path: PathBuf,
        diffs: Vec<SectionDiff>,
    },

    #[error("Cannot edit {path:?}: {reason}")]
    UnsupportedYamlLayout { path: PathBuf, reason: String },
}

/// Returns the typed root cause of `err`, if it carries one.
pub fn kind(err: &anyhow::Error) -> Option<&Error> {
    err.downcast_ref::<Error>()
}
