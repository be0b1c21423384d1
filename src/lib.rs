pub mod chain;
pub mod cli;
pub mod config;
pub mod create;
pub mod entity;
pub mod error;
pub mod generated;
pub mod loader;
pub mod migrate;
pub mod store;
pub mod table_cmd;
pub mod transform;
pub mod version;
pub mod yaml_edit;
pub mod yaml_provider;

use std::{env, sync::OnceLock};

use anyhow::Result;
use clap::Parser;
use log::{LevelFilter, debug};

use crate::cli::{Cli, Commands};
use crate::config::LayoutConfig;

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("table_versioner", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let layout = resolve_layout(&cli)?;
    match &cli.command {
        Commands::Versions => table_cmd::list_versions(&layout),
        Commands::Validate(args) => table_cmd::validate(args, &layout),
        Commands::Generate(args) => table_cmd::generate(args, &layout),
        Commands::Scaffold(args) => table_cmd::scaffold(args, &layout),
        Commands::Create(args) => table_cmd::create(args, &layout),
        Commands::Migrate(args) => migrate::execute(args, &layout),
    }
}

fn resolve_layout(cli: &Cli) -> Result<LayoutConfig> {
    let mut layout = match &cli.config {
        Some(path) => LayoutConfig::load(path)?,
        None => LayoutConfig::default(),
    };
    if let Some(root) = &cli.tables_root {
        layout.tables_root = root.clone();
    }
    debug!("Tables root: {:?}", layout.tables_root);
    Ok(layout)
}
