mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{TestWorkspace, USER_MANAGER, manager, user_record};
use serde_json::json;
use table_versioner::entity::StorageRecord;
use table_versioner::error::{self, Error};
use table_versioner::loader::ModuleRegistry;
use table_versioner::migrate::{MigrateOptions, MigrateProgress, MigrateSummary, migrate};
use table_versioner::store::{MemoryTable, RecordStore};
use table_versioner::transform::{
    TransformContext, TransformHandler, TransformMap, TransformOutput, handler_fn,
};

fn users(count: usize) -> Vec<StorageRecord> {
    let schema = manager(USER_MANAGER);
    (0..count)
        .map(|idx| user_record(&schema, &format!("u{idx:03}"), &format!("user {idx}")))
        .collect()
}

fn two_versions() -> TestWorkspace {
    let workspace = TestWorkspace::new();
    workspace.add_version("000", Some(USER_MANAGER));
    workspace.add_version("001", Some(USER_MANAGER));
    workspace
}

fn with_transforms(workspace: &TestWorkspace, transforms: TransformMap) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register_transforms(
        workspace.tables_root().join("001").join("transform.yml"),
        transforms,
    );
    registry
}

#[tokio::test]
async fn default_chain_copies_every_record_in_one_batch() {
    let workspace = two_versions();
    let source = MemoryTable::with_records("source", users(2));
    let target = MemoryTable::new("target");

    let summary = migrate(
        &source,
        &target,
        &workspace.layout(),
        &ModuleRegistry::new(),
        MigrateOptions::new("000", "001"),
    )
    .await
    .expect("migrate");

    assert_eq!(
        summary,
        MigrateSummary {
            pages: 1,
            items: 2,
            outputs: 2
        }
    );
    let batches = target.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], users(2));
}

#[tokio::test]
async fn dropping_every_record_writes_nothing() {
    let workspace = two_versions();
    let registry = with_transforms(
        &workspace,
        TransformMap::new()
            .with_handler("user", handler_fn(|_record, _context| Ok(TransformOutput::Drop))),
    );
    let source = MemoryTable::with_records("source", users(3));
    let target = MemoryTable::new("target");

    let summary = migrate(
        &source,
        &target,
        &workspace.layout(),
        &registry,
        MigrateOptions::new("000", "001"),
    )
    .await
    .expect("migrate");

    assert_eq!(summary.items, 3);
    assert_eq!(summary.outputs, 0);
    assert!(target.batches().await.is_empty());
}

fn fan_out(copies: usize) -> TransformMap {
    TransformMap::new().with_handler(
        "user",
        handler_fn(move |record, context| {
            let item = context.prev.remove_keys(context.entity_token, &record)?;
            let base = item["userId"].as_str().unwrap_or_default().to_string();
            Ok((0..copies)
                .map(|copy| {
                    let mut out = item.clone();
                    out.insert("userId".to_string(), json!(format!("{base}-{copy}")));
                    out
                })
                .collect::<Vec<_>>()
                .into())
        }),
    )
}

#[tokio::test]
async fn fan_out_writes_all_outputs_together() {
    let workspace = two_versions();
    let registry = with_transforms(&workspace, fan_out(2));
    let source = MemoryTable::with_records("source", users(1));
    let target = MemoryTable::new("target");

    let summary = migrate(
        &source,
        &target,
        &workspace.layout(),
        &registry,
        MigrateOptions::new("0", "1"),
    )
    .await
    .expect("migrate");

    assert_eq!(summary.outputs, 2);
    let batches = target.batches().await;
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[0][0]["rangeKey"], json!("userId#u000-0"));
    assert_eq!(batches[0][1]["rangeKey"], json!("userId#u000-1"));
}

/// Sleeps less for later records on a page so they finish first, and records
/// the highest number of transforms running at once.
#[derive(Clone, Default)]
struct Staggered {
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl TransformHandler for Staggered {
    async fn transform(
        &self,
        record: StorageRecord,
        context: &TransformContext<'_>,
    ) -> anyhow::Result<TransformOutput> {
        let item = context.prev.remove_keys(context.entity_token, &record)?;
        let index: u64 = item["userId"]
            .as_str()
            .and_then(|id| id.trim_start_matches('u').parse().ok())
            .unwrap_or_default();
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(4 * (5 - index % 5))).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(item.into())
    }
}

#[tokio::test]
async fn concurrency_does_not_change_output_order() {
    let workspace = two_versions();

    let mut runs = Vec::new();
    let mut peaks = Vec::new();
    for concurrency in [1, 4] {
        let handler = Staggered::default();
        let registry = with_transforms(
            &workspace,
            TransformMap::new().with_handler("user", handler.clone()),
        );
        let source = MemoryTable::with_records("source", users(23));
        let target = MemoryTable::new("target");
        let mut options = MigrateOptions::new("000", "001");
        options.page_size = 5;
        options.transform_concurrency = concurrency;
        let summary = migrate(&source, &target, &workspace.layout(), &registry, options)
            .await
            .expect("migrate");
        assert_eq!(summary.pages, 5);
        runs.push((summary, target.batches().await));
        peaks.push(handler.peak.load(Ordering::SeqCst));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].1.concat(), users(23));
    assert_eq!(peaks[0], 1);
    assert!(peaks[1] > 1 && peaks[1] <= 4, "peak in flight {}", peaks[1]);
}

#[tokio::test]
async fn limit_truncates_the_final_batch_and_stops() {
    let workspace = two_versions();
    let registry = with_transforms(&workspace, fan_out(3));
    let source = MemoryTable::with_records("source", users(10));
    let target = MemoryTable::new("target");
    let mut options = MigrateOptions::new("000", "001");
    options.page_size = 2;
    options.limit = Some(7);

    let summary = migrate(&source, &target, &workspace.layout(), &registry, options)
        .await
        .expect("migrate");

    assert_eq!(summary.outputs, 7);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.items, 4);
    let sizes = target
        .batches()
        .await
        .iter()
        .map(Vec::len)
        .collect::<Vec<_>>();
    assert_eq!(sizes, vec![6, 1]);
}

#[tokio::test]
async fn limit_reached_exactly_on_a_page_boundary_stops() {
    let workspace = two_versions();
    let source = MemoryTable::with_records("source", users(6));
    let target = MemoryTable::new("target");
    let mut options = MigrateOptions::new("000", "001");
    options.page_size = 2;
    options.limit = Some(4);

    let summary = migrate(
        &source,
        &target,
        &workspace.layout(),
        &ModuleRegistry::new(),
        options,
    )
    .await
    .expect("migrate");
    assert_eq!((summary.pages, summary.outputs), (2, 4));
}

#[tokio::test]
async fn final_progress_report_carries_the_totals() {
    let workspace = two_versions();
    let source = MemoryTable::with_records("source", users(5));
    let target = MemoryTable::new("target");
    let reports: Arc<Mutex<Vec<MigrateProgress>>> = Arc::default();
    let sink = Arc::clone(&reports);
    let mut options = MigrateOptions::new("000", "001").on_progress(move |progress| {
        sink.lock().expect("progress lock").push(*progress);
    });
    options.page_size = 2;
    options.progress_interval = Duration::from_secs(3600);

    let summary = migrate(
        &source,
        &target,
        &workspace.layout(),
        &ModuleRegistry::new(),
        options,
    )
    .await
    .expect("migrate");

    let reports = reports.lock().expect("progress lock");
    assert_eq!(reports.len(), 1);
    let last = reports[0];
    assert_eq!(
        (last.pages, last.items, last.outputs),
        (summary.pages, summary.items, summary.outputs)
    );
}

#[tokio::test]
async fn zero_interval_reports_after_every_page() {
    let workspace = two_versions();
    let source = MemoryTable::with_records("source", users(4));
    let target = MemoryTable::new("target");
    let mut pages_seen = Vec::new();
    let mut options = MigrateOptions::new("000", "001")
        .on_progress(|progress: &MigrateProgress| pages_seen.push(progress.pages));
    options.page_size = 2;
    options.progress_interval = Duration::ZERO;

    migrate(
        &source,
        &target,
        &workspace.layout(),
        &ModuleRegistry::new(),
        options,
    )
    .await
    .expect("migrate");
    assert_eq!(pages_seen, vec![1, 2, 2]);
}

#[tokio::test]
async fn empty_source_reads_one_empty_page() {
    let workspace = two_versions();
    let source = MemoryTable::new("source");
    let target = MemoryTable::new("target");
    let summary = migrate(
        &source,
        &target,
        &workspace.layout(),
        &ModuleRegistry::new(),
        MigrateOptions::new("000", "001"),
    )
    .await
    .expect("migrate");
    assert_eq!(
        summary,
        MigrateSummary {
            pages: 1,
            items: 0,
            outputs: 0
        }
    );
    assert!(target.records().await.is_empty());
}

#[tokio::test]
async fn missing_version_directories_fail_before_scanning() {
    let workspace = two_versions();
    let source = MemoryTable::with_records("source", users(1));
    let target = MemoryTable::new("target");
    let err = migrate(
        &source,
        &target,
        &workspace.layout(),
        &ModuleRegistry::new(),
        MigrateOptions::new("000", "005"),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        error::kind(&err),
        Some(Error::VersionDirectoryNotFound { .. })
    ));
    assert!(target.batches().await.is_empty());
}

#[tokio::test]
async fn failing_transform_aborts_after_earlier_batches() {
    let workspace = two_versions();
    let registry = with_transforms(
        &workspace,
        TransformMap::new().with_handler(
            "user",
            handler_fn(|record, context| {
                if record["userId"] == json!("u003") {
                    anyhow::bail!("cannot migrate u003");
                }
                let item = context.prev.remove_keys(context.entity_token, &record)?;
                Ok(TransformOutput::One(item))
            }),
        ),
    );
    let source = MemoryTable::with_records("source", users(6));
    let target = MemoryTable::new("target");
    let mut options = MigrateOptions::new("000", "001");
    options.page_size = 2;

    let err = migrate(&source, &target, &workspace.layout(), &registry, options)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("cannot migrate u003"));
    assert_eq!(target.batches().await.len(), 1);
    assert_eq!(target.table_name(), "target");
}

#[tokio::test]
async fn zero_page_size_is_rejected() {
    let workspace = two_versions();
    let mut options = MigrateOptions::new("000", "001");
    options.page_size = 0;
    let err = migrate(
        &MemoryTable::new("source"),
        &MemoryTable::new("target"),
        &workspace.layout(),
        &ModuleRegistry::new(),
        options,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("Page size"));
}
