//! Scan → transform → write loop between two table versions.
//!
//! One page is in flight at a time. Records on a page run through the step
//! chain with bounded concurrency, and their outputs are reassembled in source
//! order before the page is written as a single batch.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info};

use crate::chain::{StepContext, apply_step_chain, build_step_contexts};
use crate::cli::MigrateArgs;
use crate::config::LayoutConfig;
use crate::entity::StorageRecord;
use crate::loader::{ModuleLoader, ModuleRegistry};
use crate::store::{JsonLinesTable, RecordStore};
use crate::version::resolve_version_directory;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrateProgress {
    pub pages: usize,
    pub items: usize,
    pub outputs: usize,
    /// Outputs per second over the window since the previous tick; `None`
    /// when the window has no measurable duration.
    pub rate_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrateSummary {
    pub pages: usize,
    pub items: usize,
    pub outputs: usize,
}

pub type ProgressCallback<'a> = Box<dyn FnMut(&MigrateProgress) + Send + 'a>;

pub struct MigrateOptions<'a> {
    pub from_version: String,
    pub to_version: String,
    pub page_size: usize,
    pub limit: Option<usize>,
    pub transform_concurrency: usize,
    pub progress_interval: Duration,
    pub on_progress: Option<ProgressCallback<'a>>,
}

impl<'a> MigrateOptions<'a> {
    pub fn new(from_version: impl Into<String>, to_version: impl Into<String>) -> Self {
        Self {
            from_version: from_version.into(),
            to_version: to_version.into(),
            page_size: DEFAULT_PAGE_SIZE,
            limit: None,
            transform_concurrency: 1,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, callback: impl FnMut(&MigrateProgress) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for MigrateOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrateOptions")
            .field("from_version", &self.from_version)
            .field("to_version", &self.to_version)
            .field("page_size", &self.page_size)
            .field("limit", &self.limit)
            .field("transform_concurrency", &self.transform_concurrency)
            .field("progress_interval", &self.progress_interval)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

/// Tracks the current progress window. Owned by the migration loop only.
struct ProgressWindow<'a> {
    callback: Option<ProgressCallback<'a>>,
    interval: Duration,
    started: Instant,
    outputs_at_start: usize,
}

impl<'a> ProgressWindow<'a> {
    fn new(callback: Option<ProgressCallback<'a>>, interval: Duration) -> Self {
        Self {
            callback,
            interval,
            started: Instant::now(),
            outputs_at_start: 0,
        }
    }

    fn tick(&mut self, summary: &MigrateSummary, force: bool) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };
        let elapsed = self.started.elapsed();
        if !force && elapsed < self.interval {
            return;
        }
        let window_outputs = summary.outputs - self.outputs_at_start;
        let seconds = elapsed.as_secs_f64();
        let rate_per_sec = (seconds > 0.0).then(|| window_outputs as f64 / seconds);
        callback(&MigrateProgress {
            pages: summary.pages,
            items: summary.items,
            outputs: summary.outputs,
            rate_per_sec,
        });
        self.started = Instant::now();
        self.outputs_at_start = summary.outputs;
    }
}

/// Migrates every record of `source` from `from_version` to `to_version` into `target`.
///
/// Any failure aborts the run. Batches written before the failure stay
/// written, and no partial summary is returned; use the progress callback to
/// observe intermediate counts.
pub async fn migrate(
    source: &dyn RecordStore,
    target: &dyn RecordStore,
    layout: &LayoutConfig,
    loader: &dyn ModuleLoader,
    options: MigrateOptions<'_>,
) -> Result<MigrateSummary> {
    if options.page_size == 0 {
        return Err(anyhow!("Page size must be positive"));
    }
    if options.transform_concurrency == 0 {
        return Err(anyhow!("Transform concurrency must be positive"));
    }
    resolve_version_directory(&options.from_version, &layout.tables_root, true)?;
    resolve_version_directory(&options.to_version, &layout.tables_root, true)?;

    let steps = build_step_contexts(
        &options.from_version,
        &options.to_version,
        layout,
        loader,
    )
    .await?;

    info!(
        "Migrating '{}' -> '{}' (page size {}, concurrency {}, limit {})",
        source.table_name(),
        target.table_name(),
        options.page_size,
        options.transform_concurrency,
        options
            .limit
            .map(|limit| limit.to_string())
            .unwrap_or_else(|| "none".to_string())
    );

    let mut summary = MigrateSummary::default();
    let mut progress = ProgressWindow::new(options.on_progress, options.progress_interval);
    let mut cursor = None;
    loop {
        let page = source
            .scan_page(cursor.take(), options.page_size)
            .await
            .with_context(|| format!("Scanning '{}'", source.table_name()))?;
        let read = page.records.len();

        let mut batch =
            transform_page(page.records, &steps, options.transform_concurrency).await?;
        let mut limit_reached = false;
        if let Some(limit) = options.limit {
            let remaining = limit.saturating_sub(summary.outputs);
            if batch.len() >= remaining {
                batch.truncate(remaining);
                limit_reached = true;
            }
        }

        let written = batch.len();
        if !batch.is_empty() {
            target
                .batch_write(batch)
                .await
                .with_context(|| format!("Writing batch to '{}'", target.table_name()))?;
        }
        summary.pages += 1;
        summary.items += read;
        summary.outputs += written;
        debug!(
            "Page {}: read {read} record(s), wrote {written} output(s)",
            summary.pages
        );
        progress.tick(&summary, false);

        cursor = page.cursor;
        if limit_reached || cursor.is_none() {
            break;
        }
    }
    progress.tick(&summary, true);

    info!(
        "Migration complete: {} page(s), {} item(s) read, {} output(s) written",
        summary.pages, summary.items, summary.outputs
    );
    Ok(summary)
}

/// Runs the chain over a page with at most `concurrency` records in flight,
/// flattening outputs in source order.
async fn transform_page(
    records: Vec<StorageRecord>,
    steps: &[StepContext],
    concurrency: usize,
) -> Result<Vec<StorageRecord>> {
    let per_record: Vec<Vec<StorageRecord>> = stream::iter(records)
        .map(|record| apply_step_chain(record, steps))
        .buffered(concurrency)
        .try_collect()
        .await?;
    Ok(per_record.into_iter().flatten().collect())
}

pub fn execute(args: &MigrateArgs, layout: &LayoutConfig) -> Result<()> {
    if same_file(&args.source, &args.target) {
        bail!(
            "Source and target name the same table file {:?}",
            args.source
        );
    }
    let source = JsonLinesTable::open(&args.source)
        .with_context(|| format!("Opening source table {:?}", args.source))?;
    let target = if args.append {
        JsonLinesTable::open(&args.target)
    } else {
        JsonLinesTable::create(&args.target)
    }
    .with_context(|| format!("Opening target table {:?}", args.target))?;
    let loader = ModuleRegistry::new();

    let mut options = MigrateOptions::new(&args.from_version, &args.to_version);
    options.page_size = args.page_size;
    options.limit = args.limit;
    options.transform_concurrency = args.concurrency;
    options.progress_interval = Duration::from_millis(args.progress_interval_ms);
    let options = options.on_progress(|progress| {
        info!(
            "Progress: {} page(s), {} item(s), {} output(s){}",
            progress.pages,
            progress.items,
            progress.outputs,
            progress
                .rate_per_sec
                .map(|rate| format!(", {rate:.1}/s"))
                .unwrap_or_default()
        );
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Starting async runtime")?;
    let summary = runtime.block_on(migrate(&source, &target, layout, &loader, options))?;
    target.finish()?;
    info!(
        "Wrote {} record(s) to {:?}",
        summary.outputs,
        target.path()
    );
    Ok(())
}

fn same_file(source: &Path, target: &Path) -> bool {
    match (fs::canonicalize(source), fs::canonicalize(target)) {
        (Ok(source), Ok(target)) => source == target,
        _ => false,
    }
}
