use crate::activity::{InvocationRecord, RecordStatus, RecordType, TRUNCATION_SUFFIX, cutoff_key};
use crate::bus::{EventBus, ProxyEvent};
use crate::config::Config;
use crate::store::{BUCKET_ACTIVITY, Store};
use crate::utils::truncate_bytes;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 512;
const STREAM_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub max_response_size: usize,
    pub retention_days: u32,
    pub max_records: usize,
    pub cleanup_interval: Duration,
    pub queue_capacity: usize,
}

impl RecorderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_response_size: config.activity_max_response_size,
            retention_days: config.activity_retention_days,
            max_records: config.activity_max_records,
            cleanup_interval: Duration::from_secs(config.activity_cleanup_interval_min * 60),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub server_name: Option<String>,
    pub record_type: Option<RecordType>,
    pub status: Option<RecordStatus>,
}

impl ActivityFilter {
    fn matches(&self, record: &InvocationRecord) -> bool {
        if let Some(server) = &self.server_name {
            if record.server_name.as_deref() != Some(server.as_str()) {
                return false;
            }
        }
        if let Some(kind) = self.record_type {
            if record.record_type != kind {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        true
    }
}

/// Append-only, time-keyed invocation log.
///
/// Writes are fire-and-forget: `record()` pushes into a bounded in-memory
/// queue drained by a writer task. On overflow the oldest queued writes are
/// dropped with a warning. Stored records are never dropped by overflow,
/// only by the pruning policy.
pub struct ActivityRecorder {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    store: Arc<Store>,
    bus: EventBus,
    settings: RecorderSettings,
    queue: Mutex<VecDeque<InvocationRecord>>,
    notify: Notify,
}

impl ActivityRecorder {
    pub fn new(store: Arc<Store>, bus: EventBus, settings: RecorderSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                settings,
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
            shutdown_tx,
        }
    }

    /// Spawn the writer and pruner tasks.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.notify.notified() => {
                        inner.drain();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            inner.drain();
                            break;
                        }
                    }
                }
            }
            debug!("activity writer stopped");
        });

        let inner = self.inner.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.settings.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match inner.prune() {
                            Ok((expired, evicted)) if expired + evicted > 0 => {
                                debug!("activity pruned: {} expired, {} over cap", expired, evicted);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("activity pruning failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("activity pruner stopped");
        });
    }

    /// Queue a record for asynchronous persistence. Oversized responses are
    /// truncated here, at write time.
    pub fn record(&self, mut record: InvocationRecord) {
        let (text, cut) = truncate_bytes(
            &record.response_text,
            self.inner.settings.max_response_size,
            TRUNCATION_SUFFIX,
        );
        if cut {
            record.response_text = text;
            record.response_truncated = true;
        }

        {
            let mut queue = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            while queue.len() >= self.inner.settings.queue_capacity {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        "activity queue full; dropping oldest queued write {}",
                        dropped.id
                    );
                }
            }
            queue.push_back(record);
        }
        self.inner.notify.notify_one();
    }

    /// Synchronously persist everything still queued. Used by shutdown and
    /// by tests that need deterministic visibility.
    pub fn flush(&self) {
        self.inner.drain();
    }

    /// Stop background tasks after a final flush. Idempotent.
    pub fn shutdown(&self) {
        self.inner.drain();
        let _ = self.shutdown_tx.send(true);
    }

    /// Newest-first page of matching records plus the total match count.
    pub fn list(
        &self,
        filter: &ActivityFilter,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<InvocationRecord>, usize)> {
        let mut matches = Vec::new();
        let mut scan_offset = 0;
        loop {
            let batch = match self.inner.store.range_rev(BUCKET_ACTIVITY, STREAM_BATCH, scan_offset)
            {
                Ok(batch) => batch,
                Err(crate::store::StoreError::Closed) => {
                    warn!("activity list after store close; returning empty");
                    return Ok((Vec::new(), 0));
                }
                Err(e) => return Err(e.into()),
            };
            if batch.is_empty() {
                break;
            }
            scan_offset += batch.len();
            for (key, value) in batch {
                match serde_json::from_slice::<InvocationRecord>(&value) {
                    Ok(record) => {
                        if filter.matches(&record) {
                            matches.push(record);
                        }
                    }
                    Err(e) => warn!("skipping undecodable activity record {}: {}", key, e),
                }
            }
        }
        let total = matches.len();
        let page = matches.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    /// Lazy reverse-chronological cursor for large exports. The receiver
    /// ends when the log is exhausted or the caller drops it.
    pub fn stream(&self, filter: ActivityFilter) -> mpsc::Receiver<InvocationRecord> {
        let (tx, rx) = mpsc::channel(STREAM_BATCH);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut offset = 0;
            loop {
                let batch = match inner.store.range_rev(BUCKET_ACTIVITY, STREAM_BATCH, offset) {
                    Ok(batch) => batch,
                    Err(_) => break,
                };
                if batch.is_empty() {
                    break;
                }
                offset += batch.len();
                for (_, value) in batch {
                    let Ok(record) = serde_json::from_slice::<InvocationRecord>(&value) else {
                        continue;
                    };
                    if !filter.matches(&record) {
                        continue;
                    }
                    if tx.send(record).await.is_err() {
                        return; // caller cancelled
                    }
                }
            }
        });
        rx
    }

    /// Run both pruning rules once. Exposed for tests and `doctor`.
    pub fn prune_once(&self) -> Result<(usize, usize)> {
        self.inner.prune()
    }
}

impl Inner {
    fn drain(&self) {
        loop {
            let record = {
                let mut queue = self
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                queue.pop_front()
            };
            let Some(record) = record else { break };
            let key = record.storage_key();
            match self.store.put_json(BUCKET_ACTIVITY, &key, &record) {
                Ok(()) => {
                    self.bus
                        .publish(ProxyEvent::ActivityRecorded { id: record.id });
                }
                Err(crate::store::StoreError::Closed) => {
                    debug!("store closed; discarding queued activity record");
                }
                Err(e) => warn!("failed to persist activity record: {}", e),
            }
        }
    }

    /// Rule (a): drop records past retention. Rule (b): if still over the
    /// cap, drop oldest until at 90% of it.
    fn prune(&self) -> Result<(usize, usize)> {
        let cutoff = cutoff_key(Utc::now() - ChronoDuration::days(i64::from(self.settings.retention_days)));
        let expired = self.store.delete_below(BUCKET_ACTIVITY, &cutoff)?;

        let mut evicted = 0;
        let count = self.store.count(BUCKET_ACTIVITY)? as usize;
        if count > self.settings.max_records {
            let target = self.settings.max_records * 9 / 10;
            evicted = self.store.delete_oldest(BUCKET_ACTIVITY, count - target)?;
        }
        Ok((expired, evicted))
    }
}
