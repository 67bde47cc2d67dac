//! Incremental mirror of a remote queue.
//!
//! One tick:
//! 1. list every message with a code above the persisted watermark;
//! 2. walk the entries in ascending code order, each under its lock,
//!    fetching the body at most once and writing it to every interested
//!    sink that does not already have it;
//! 3. advance the watermark to the highest code seen.
//!
//! Per-entry failures are logged and counted; only a failed listing or a
//! failed watermark update ends the tick with an error.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::lock::LockManager;
use super::sink::{delivery_stem, Delivery, Sink};
use super::watermark::WatermarkStore;
use crate::envelope::MessageListEntry;
use crate::error::{SyncError, ValidationFault};
use crate::ops::{GetClient, GetSelector, ListClient, ListQuery};

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    pub listed: usize,
    pub delivered: usize,
    pub skipped_existing: usize,
    /// Entries whose lock was held by someone else.
    pub skipped_locked: usize,
    /// Entries no sink was interested in.
    pub filtered: usize,
    pub failed: usize,
    /// Watermark after the tick.
    pub watermark: u64,
}

pub struct SyncEngine {
    name: String,
    key: String,
    list: ListClient,
    get: GetClient,
    locks: LockManager,
    watermarks: Arc<dyn WatermarkStore>,
    sinks: Vec<Sink>,
}

impl SyncEngine {
    /// `locks` is narrowed to `key`: another task on the same endpoint
    /// never makes this one skip a message.
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        list: ListClient,
        get: GetClient,
        locks: LockManager,
        watermarks: Arc<dyn WatermarkStore>,
        sinks: Vec<Sink>,
    ) -> Self {
        let key: String = key.into();
        Self {
            name: name.into(),
            locks: locks.scoped(&key),
            key,
            list,
            get,
            watermarks,
            sinks,
        }
    }

    /// Watermark key of a task: endpoint plus task name, so tasks with
    /// different sinks on one endpoint do not hide messages from each other.
    pub fn watermark_key(endpoint_url: &str, task: &str) -> String {
        format!("{endpoint_url}#{task}")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn load_watermark(&self) -> Result<u64, SyncError> {
        let store = Arc::clone(&self.watermarks);
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || store.load(&key))
            .await
            .map_err(|e| self.join_error(e))?
    }

    async fn advance_watermark(&self, code: u64) -> Result<u64, SyncError> {
        let store = Arc::clone(&self.watermarks);
        let key = self.key.clone();
        tokio::task::spawn_blocking(move || store.advance(&key, code))
            .await
            .map_err(|e| self.join_error(e))?
    }

    fn join_error(&self, e: tokio::task::JoinError) -> SyncError {
        SyncError::Watermark {
            key: self.key.clone(),
            source: std::io::Error::other(e),
        }
    }

    pub async fn tick(&self) -> Result<TickStats, SyncError> {
        let start = self.load_watermark().await?;
        debug!(task = %self.name, watermark = start, "Tick started");

        let listing = match self.list.list(&ListQuery::after(start)).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(task = %self.name, "Listing failed, watermark stays at {}: {}", start, e);
                return Err(SyncError::List(e));
            }
        };

        let mut stats = TickStats {
            listed: listing.entries.len(),
            watermark: start,
            ..Default::default()
        };

        // Never trust the order or the last element: take the max.
        let mut max_code = start;
        for fault in &listing.faults {
            if let ValidationFault::MissingEntryFields { code: Some(code), .. } = fault {
                max_code = max_code.max(*code);
            }
        }

        let mut entries = listing.entries;
        entries.sort_by_key(|e| e.code);

        for entry in &entries {
            max_code = max_code.max(entry.code);
            if let Err(e) = self.process(entry, &mut stats).await {
                stats.failed += 1;
                warn!(task = %self.name, code = entry.code, "Entry failed: {}", e);
            }
        }

        if max_code > start {
            stats.watermark = self.advance_watermark(max_code).await?;
        }

        info!(
            task = %self.name,
            listed = stats.listed,
            delivered = stats.delivered,
            existing = stats.skipped_existing,
            locked = stats.skipped_locked,
            filtered = stats.filtered,
            failed = stats.failed,
            watermark = stats.watermark,
            "Tick complete"
        );
        Ok(stats)
    }

    async fn process(&self, entry: &MessageListEntry, stats: &mut TickStats) -> Result<(), SyncError> {
        let sinks: Vec<&Sink> = self
            .sinks
            .iter()
            .filter(|s| s.accepts(&entry.message_type))
            .collect();
        if sinks.is_empty() {
            stats.filtered += 1;
            return Ok(());
        }

        let Some(guard) = self.locks.try_lock(entry.code)? else {
            stats.skipped_locked += 1;
            return Ok(());
        };

        let delivered = self.deliver(entry, &sinks, stats).await;
        let released = guard.release();
        delivered?;
        released
    }

    async fn deliver(
        &self,
        entry: &MessageListEntry,
        sinks: &[&Sink],
        stats: &mut TickStats,
    ) -> Result<(), SyncError> {
        let stem = delivery_stem(entry);
        let mut body: Option<Delivery> = None;
        let mut first_error = None;

        for sink in sinks {
            if let Some(existing) = sink.existing_delivery(&stem) {
                debug!(code = entry.code, path = %existing.display(), "Already delivered");
                stats.skipped_existing += 1;
                continue;
            }

            if body.is_none() {
                body = Some(self.fetch(entry).await?);
            }
            let Some(delivery) = body.as_ref() else {
                continue;
            };

            match sink.deliver(&stem, delivery).await {
                Ok(Some(path)) => {
                    stats.delivered += 1;
                    if let Err(e) = sink.run_hook(&path, &entry.message_type).await {
                        warn!(code = entry.code, "{}", e);
                        first_error.get_or_insert(e);
                    }
                }
                Ok(None) => stats.skipped_existing += 1,
                Err(e) => {
                    warn!(code = entry.code, folder = %sink.folder().display(), "{}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fetch(&self, entry: &MessageListEntry) -> Result<Delivery, SyncError> {
        let result = self
            .get
            .get(&GetSelector::Code(entry.code))
            .await
            .map_err(|source| SyncError::Fetch {
                code: entry.code,
                source,
            })?;
        Ok(Delivery::from_content(result.content))
    }
}
