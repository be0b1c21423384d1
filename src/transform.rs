//! Per-entity transform handlers applied during a migration step.
//!
//! A handler receives a storage record of the previous version and decides
//! whether it disappears, becomes one record, or fans out into several. Entities
//! without a handler take the default chain instead.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::entity::{LogicalItem, SchemaManager, StorageRecord};

/// Schema pair and entity identity handed to a transform handler.
pub struct TransformContext<'a> {
    pub prev: &'a dyn SchemaManager,
    pub next: &'a dyn SchemaManager,
    pub entity_token: &'a str,
    pub version: &'a str,
}

impl TransformContext<'_> {
    /// Applies the default chain for this record: strip previous keys, add next keys.
    pub fn default_chain(&self, record: &StorageRecord) -> Result<StorageRecord> {
        let item = self.prev.remove_keys(self.entity_token, record)?;
        self.next.add_keys(self.entity_token, &item)
    }
}

/// Normalized handler result.
///
/// Each produced value is either a logical item (no next-version key fields)
/// or an already-keyed storage record.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutput {
    Drop,
    One(LogicalItem),
    Many(Vec<LogicalItem>),
}

impl TransformOutput {
    pub fn into_items(self) -> Vec<LogicalItem> {
        match self {
            TransformOutput::Drop => Vec::new(),
            TransformOutput::One(item) => vec![item],
            TransformOutput::Many(items) => items,
        }
    }
}

impl From<Option<LogicalItem>> for TransformOutput {
    fn from(value: Option<LogicalItem>) -> Self {
        value.map_or(TransformOutput::Drop, TransformOutput::One)
    }
}

impl From<LogicalItem> for TransformOutput {
    fn from(value: LogicalItem) -> Self {
        TransformOutput::One(value)
    }
}

impl From<Vec<LogicalItem>> for TransformOutput {
    fn from(value: Vec<LogicalItem>) -> Self {
        TransformOutput::Many(value)
    }
}

#[async_trait]
pub trait TransformHandler: Send + Sync {
    async fn transform(
        &self,
        record: StorageRecord,
        context: &TransformContext<'_>,
    ) -> Result<TransformOutput>;
}

/// Adapts a synchronous closure into a [`TransformHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(StorageRecord, &TransformContext<'_>) -> Result<TransformOutput> + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> TransformHandler for FnHandler<F>
where
    F: Fn(StorageRecord, &TransformContext<'_>) -> Result<TransformOutput> + Send + Sync,
{
    async fn transform(
        &self,
        record: StorageRecord,
        context: &TransformContext<'_>,
    ) -> Result<TransformOutput> {
        (self.0)(record, context)
    }
}

/// Handlers keyed by entity token. A missing entry selects the default chain.
#[derive(Clone, Default)]
pub struct TransformMap {
    handlers: BTreeMap<String, Arc<dyn TransformHandler>>,
}

impl TransformMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler<H>(mut self, entity_token: impl Into<String>, handler: H) -> Self
    where
        H: TransformHandler + 'static,
    {
        self.insert(entity_token, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, entity_token: impl Into<String>, handler: Arc<dyn TransformHandler>) {
        self.handlers.insert(entity_token.into(), handler);
    }

    pub fn get(&self, entity_token: &str) -> Option<&Arc<dyn TransformHandler>> {
        self.handlers.get(entity_token)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl fmt::Debug for TransformMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
