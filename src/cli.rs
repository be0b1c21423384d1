use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::generated::{BillingMode, ManagedTableProperties};
use crate::migrate::{DEFAULT_PAGE_SIZE, DEFAULT_PROGRESS_INTERVAL_MS};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Manage versioned table layouts, migrate records between versions, and check generated schema drift",
    long_about = None
)]
pub struct Cli {
    /// Layout configuration file (YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Directory holding one subdirectory per table version (overrides the config file)
    #[arg(long = "tables-root", global = true)]
    pub tables_root: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List version directories and where each one's schema module resolves
    Versions,
    /// Check generated table sections against the schema for one or all versions
    Validate(ValidateArgs),
    /// Rewrite (or compose) the generated sections of a version's table file
    Generate(GenerateArgs),
    /// Create a new version directory with a composed table file
    Scaffold(ScaffoldArgs),
    /// Resolve a version's final table definition and emit it as JSON
    Create(CreateArgs),
    /// Migrate a JSON-lines table dump from one version to another
    Migrate(MigrateArgs),
}

/// Non-generated table properties to take ownership of.
#[derive(Debug, Clone, Default, Args)]
pub struct ManagedArgs {
    /// Billing mode to declare
    #[arg(long = "billing-mode")]
    pub billing_mode: Option<BillingMode>,
    /// Provisioned read capacity units (requires --billing-mode provisioned)
    #[arg(long = "read-capacity-units")]
    pub read_capacity_units: Option<u64>,
    /// Provisioned write capacity units (requires --billing-mode provisioned)
    #[arg(long = "write-capacity-units")]
    pub write_capacity_units: Option<u64>,
    /// Table name to declare in the file
    #[arg(long = "table-name")]
    pub table_name: Option<String>,
}

impl ManagedArgs {
    pub fn to_managed(&self) -> Option<ManagedTableProperties> {
        let managed = ManagedTableProperties {
            billing_mode: self.billing_mode,
            read_capacity_units: self.read_capacity_units,
            write_capacity_units: self.write_capacity_units,
            table_name: self.table_name.clone(),
        };
        (!managed.is_empty()).then_some(managed)
    }
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Version to validate (all versions with a table file when omitted)
    pub version: Option<String>,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Version whose table file should be refreshed
    pub version: String,
    #[command(flatten)]
    pub managed: ManagedArgs,
}

#[derive(Debug, Args)]
pub struct ScaffoldArgs {
    /// Version number for the new directory
    pub version: String,
    /// Zero-pad the directory token to this width (defaults to the widest existing token)
    #[arg(long)]
    pub width: Option<usize>,
    #[command(flatten)]
    pub managed: ManagedArgs,
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Version whose table should be created
    pub version: String,
    /// Rewrite generated sections in place before creating
    #[arg(long = "refresh-generated")]
    pub refresh_generated: bool,
    /// Skip the generated-section drift check
    #[arg(long = "skip-validation")]
    pub skip_validation: bool,
    /// Create even if the generated sections drifted
    #[arg(long)]
    pub force: bool,
    /// Table name to use for this creation only
    #[arg(long = "table-name-override")]
    pub table_name_override: Option<String>,
    /// Write the definition to this file instead of stdout
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    #[command(flatten)]
    pub managed: ManagedArgs,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Source table dump (one JSON object per line)
    #[arg(short = 'i', long = "source")]
    pub source: PathBuf,
    /// Target table dump to write
    #[arg(short = 'o', long = "target")]
    pub target: PathBuf,
    /// Append to the target instead of truncating it
    #[arg(long)]
    pub append: bool,
    /// Version the source records are stored in
    #[arg(long = "from")]
    pub from_version: String,
    /// Version to migrate records to
    #[arg(long = "to")]
    pub to_version: String,
    /// Records requested per scan page
    #[arg(long = "page-size", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
    /// Stop after writing this many output records
    #[arg(long)]
    pub limit: Option<usize>,
    /// Records transformed concurrently within a page
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,
    /// Minimum milliseconds between progress reports
    #[arg(long = "progress-interval-ms", default_value_t = DEFAULT_PROGRESS_INTERVAL_MS)]
    pub progress_interval_ms: u64,
}
