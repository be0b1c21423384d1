//! Record store collaborator.
//!
//! The migration engine only needs cursor-paginated scans and batched writes.
//! Retrying unprocessed items is the store's business, not the engine's.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::entity::StorageRecord;

/// Opaque continuation token returned by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor(pub Value);

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub records: Vec<StorageRecord>,
    pub cursor: Option<Cursor>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    fn table_name(&self) -> &str;

    async fn scan_page(&self, cursor: Option<Cursor>, limit: usize) -> Result<ScanPage>;

    async fn batch_write(&self, records: Vec<StorageRecord>) -> Result<()>;
}

fn offset_from(cursor: Option<&Cursor>) -> Result<usize> {
    match cursor {
        None => Ok(0),
        Some(Cursor(value)) => value
            .as_u64()
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| anyhow!("Unrecognised scan cursor {value}")),
    }
}

fn slice_page(records: &[StorageRecord], offset: usize, limit: usize) -> Result<ScanPage> {
    if limit == 0 {
        bail!("Scan page size must be positive");
    }
    let end = records.len().min(offset.saturating_add(limit));
    let page = records.get(offset..end).unwrap_or_default().to_vec();
    let cursor = (end < records.len()).then(|| Cursor(Value::from(end as u64)));
    Ok(ScanPage {
        records: page,
        cursor,
    })
}

/// In-memory table that keeps every batched write call for inspection.
#[derive(Debug, Default)]
pub struct MemoryTable {
    name: String,
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<StorageRecord>,
    batches: Vec<Vec<StorageRecord>>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::default(),
        }
    }

    pub fn with_records(name: impl Into<String>, records: Vec<StorageRecord>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MemoryState {
                records,
                batches: Vec::new(),
            }),
        }
    }

    pub async fn records(&self) -> Vec<StorageRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn batches(&self) -> Vec<Vec<StorageRecord>> {
        self.state.lock().await.batches.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn scan_page(&self, cursor: Option<Cursor>, limit: usize) -> Result<ScanPage> {
        let offset = offset_from(cursor.as_ref())?;
        let state = self.state.lock().await;
        slice_page(&state.records, offset, limit)
    }

    async fn batch_write(&self, records: Vec<StorageRecord>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.records.extend(records.iter().cloned());
        state.batches.push(records);
        Ok(())
    }
}

/// Table dump with one JSON object per line. Scans read a snapshot taken at
/// open; writes append to the file.
///
/// A table opened with [`JsonLinesTable::create`] leaves the file alone until
/// the first write (or [`JsonLinesTable::finish`]) truncates it.
#[derive(Debug)]
pub struct JsonLinesTable {
    name: String,
    path: PathBuf,
    snapshot: Vec<StorageRecord>,
    truncate_pending: AtomicBool,
}

impl JsonLinesTable {
    pub fn open(path: &Path) -> Result<Self> {
        let snapshot = if path.exists() {
            read_json_lines(path)?
        } else {
            Vec::new()
        };
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        Ok(Self {
            name,
            path: path.to_path_buf(),
            snapshot,
            truncate_pending: AtomicBool::new(false),
        })
    }

    /// Opens `path` as an empty output table. Previous contents are replaced
    /// on the first write, so a run that fails early keeps the old file.
    pub fn create(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string());
        Ok(Self {
            name,
            path: path.to_path_buf(),
            snapshot: Vec::new(),
            truncate_pending: AtomicBool::new(true),
        })
    }

    /// Truncates a created table that never received a batch.
    pub fn finish(&self) -> Result<()> {
        if self.truncate_pending.swap(false, Ordering::SeqCst) {
            fs::write(&self.path, "")
                .with_context(|| format!("Creating table file {:?}", self.path))?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn read_json_lines(path: &Path) -> Result<Vec<StorageRecord>> {
    let raw = fs::read_to_string(path).with_context(|| format!("Reading table file {path:?}"))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            match serde_json::from_str::<Value>(line)
                .with_context(|| format!("Parsing line {} of {path:?}", idx + 1))?
            {
                Value::Object(record) => Ok(record),
                other => Err(anyhow!(
                    "Line {} of {path:?} is not a JSON object: {other}",
                    idx + 1
                )),
            }
        })
        .collect()
}

#[async_trait]
impl RecordStore for JsonLinesTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn scan_page(&self, cursor: Option<Cursor>, limit: usize) -> Result<ScanPage> {
        slice_page(&self.snapshot, offset_from(cursor.as_ref())?, limit)
    }

    async fn batch_write(&self, records: Vec<StorageRecord>) -> Result<()> {
        let truncate = self.truncate_pending.swap(false, Ordering::SeqCst);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(truncate)
            .append(!truncate)
            .open(&self.path)
            .with_context(|| format!("Opening table file {:?} for write", self.path))?;
        let mut writer = BufWriter::new(file);
        for record in &records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer
            .flush()
            .with_context(|| format!("Flushing table file {:?}", self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(count: usize) -> Vec<StorageRecord> {
        (0..count)
            .map(|idx| json!({ "id": idx }).as_object().cloned().expect("object"))
            .collect()
    }

    #[tokio::test]
    async fn memory_scan_pages_until_exhausted() {
        let table = MemoryTable::with_records("source", rows(5));
        let first = table.scan_page(None, 2).await.expect("page");
        assert_eq!(first.records.len(), 2);
        let second = table.scan_page(first.cursor, 2).await.expect("page");
        assert_eq!(second.records[0]["id"], json!(2));
        let third = table.scan_page(second.cursor, 2).await.expect("page");
        assert_eq!(third.records.len(), 1);
        assert!(third.cursor.is_none());
    }

    #[tokio::test]
    async fn empty_table_yields_one_empty_page() {
        let table = MemoryTable::new("empty");
        let page = table.scan_page(None, 10).await.expect("page");
        assert!(page.records.is_empty());
        assert!(page.cursor.is_none());
        assert!(table.scan_page(None, 0).await.is_err());
    }

    #[tokio::test]
    async fn bogus_cursor_is_rejected() {
        let table = MemoryTable::with_records("source", rows(1));
        let err = table
            .scan_page(Some(Cursor(json!("abc"))), 1)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unrecognised scan cursor"));
    }

    #[tokio::test]
    async fn json_lines_round_trip_through_append() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("target.jsonl");
        let table = JsonLinesTable::create(&path).expect("create");
        assert_eq!(table.table_name(), "target");
        table.batch_write(rows(2)).await.expect("write");
        table.batch_write(rows(1)).await.expect("write");
        let written = read_json_lines(&path).expect("read back");
        assert_eq!(written.len(), 3);
        assert_eq!(written[2]["id"], json!(0));
    }

    #[tokio::test]
    async fn created_table_keeps_old_contents_until_written() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("target.jsonl");
        fs::write(&path, "{\"id\":9}\n").expect("seed");

        let table = JsonLinesTable::create(&path).expect("create");
        assert_eq!(read_json_lines(&path).expect("read").len(), 1);
        table.batch_write(rows(2)).await.expect("write");
        let written = read_json_lines(&path).expect("read back");
        assert_eq!(written.len(), 2);
        assert_eq!(written[0]["id"], json!(0));

        let untouched = JsonLinesTable::create(&path).expect("create");
        untouched.finish().expect("finish");
        assert!(read_json_lines(&path).expect("read").is_empty());
    }

    #[test]
    fn json_lines_rejects_non_objects() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"id\":1}\n\n[1,2]\n").expect("write");
        let err = read_json_lines(&path).unwrap_err();
        assert!(err.to_string().contains("Line 3"));
    }
}
