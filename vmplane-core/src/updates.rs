//! The update feed.
//!
//! An append-only log of "object X changed" entries, each carrying a
//! sequence number from a single global counter. Watchers poll it with
//! [`Updates::get`], passing the highest sequence number they have seen.
//!
//! Sequence assignment, append and publication of the new high-water mark
//! happen under one mutex, so a reader never sees the counter move ahead of
//! the entry it belongs to.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::model::{DynamicId, DynamicValue};

/// Default number of entries kept before the oldest are evicted.
pub const DEFAULT_FEED_CAPACITY: usize = 65536;

/// A barrier marker.
///
/// A watcher that sees it knows every earlier mutation of `ids` has been
/// delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Barrier {
    /// Caller-chosen barrier id
    pub id: u64,
    pub vm: String,
    /// The VM and its devices at injection time
    pub ids: Vec<DynamicId>,
}

/// Payload of a feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEntry {
    /// Object changed. `value` is `None` when it was deleted.
    Update {
        id: DynamicId,
        value: Option<DynamicValue>,
    },
    Barrier(Barrier),
}

/// A feed entry with its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub entry: FeedEntry,
}

/// Result of [`Updates::get`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedBatch {
    /// Entries with a sequence number above the requested one, in order
    pub entries: Vec<SequencedEntry>,
    /// High-water mark to pass to the next call
    pub last_id: u64,
    /// Entries the watcher has not seen were evicted; it should resync
    /// with a VM refresh
    pub truncated: bool,
}

struct FeedLog {
    /// Last assigned sequence number
    last_seq: u64,
    entries: BTreeMap<u64, FeedEntry>,
    /// Ids whose deletion entry is still in the log -> its sequence number.
    /// Forgotten once that entry is evicted or collected.
    deleted: HashMap<DynamicId, u64>,
    /// Barrier id -> sequence number
    barriers: HashMap<u64, u64>,
    /// Every entry at or below this sequence number has been evicted
    evicted_up_to: u64,
    capacity: usize,
}

impl FeedLog {
    fn append(&mut self, entry: FeedEntry) -> u64 {
        self.last_seq += 1;
        let seq = self.last_seq;
        self.entries.insert(seq, entry);

        while self.entries.len() > self.capacity {
            if let Some((old, entry)) = self.entries.pop_first() {
                self.forget(old, &entry);
                self.evicted_up_to = old;
            }
        }
        seq
    }

    /// Drop bookkeeping for an entry that left the log.
    fn forget(&mut self, seq: u64, entry: &FeedEntry) {
        match entry {
            FeedEntry::Barrier(b) => {
                self.barriers.remove(&b.id);
            }
            FeedEntry::Update { id, value: None } => {
                if self.deleted.get(id) == Some(&seq) {
                    self.deleted.remove(id);
                }
            }
            FeedEntry::Update { .. } => {}
        }
    }

    fn collect(&self, from: u64) -> FeedBatch {
        let entries = self
            .entries
            .range(from.saturating_add(1)..)
            .map(|(seq, entry)| SequencedEntry {
                seq: *seq,
                entry: entry.clone(),
            })
            .collect();
        FeedBatch {
            entries,
            last_id: self.last_seq,
            truncated: from < self.evicted_up_to || from > self.last_seq,
        }
    }
}

/// The update feed.
pub struct Updates {
    log: Mutex<FeedLog>,
    latest: watch::Sender<u64>,
}

impl Updates {
    /// Create a feed keeping at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            log: Mutex::new(FeedLog {
                last_seq: 0,
                entries: BTreeMap::new(),
                deleted: HashMap::new(),
                barriers: HashMap::new(),
                evicted_up_to: 0,
                capacity: capacity.max(1),
            }),
            latest,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, log: &mut FeedLog, entry: FeedEntry) -> u64 {
        let seq = log.append(entry);
        self.latest.send_replace(seq);
        seq
    }

    /// Record that an object changed.
    ///
    /// Dropped, returning `None`, when the object has been deleted and not
    /// re-added since.
    pub fn record(&self, id: DynamicId, value: DynamicValue) -> Option<u64> {
        let mut log = self.lock();
        if log.deleted.contains_key(&id) {
            trace!(?id, "Dropping update for deleted object");
            return None;
        }
        Some(self.publish(&mut log, FeedEntry::Update { id, value: Some(value) }))
    }

    /// Record that an object was created, lifting any earlier deletion.
    pub fn record_created(&self, id: DynamicId, value: DynamicValue) -> u64 {
        let mut log = self.lock();
        log.deleted.remove(&id);
        self.publish(&mut log, FeedEntry::Update { id, value: Some(value) })
    }

    /// Record that an object was deleted.
    ///
    /// Task ids are never reused, so their deletions are not remembered.
    pub fn record_removed(&self, id: DynamicId) -> Option<u64> {
        let mut log = self.lock();
        if log.deleted.contains_key(&id) {
            return None;
        }
        let tracked = !matches!(id, DynamicId::Task(_));
        let seq = self.publish(
            &mut log,
            FeedEntry::Update {
                id: id.clone(),
                value: None,
            },
        );
        if tracked {
            log.deleted.insert(id, seq);
        }
        Some(seq)
    }

    /// Current high-water mark, without waiting.
    pub fn last_id(&self) -> u64 {
        self.lock().last_seq
    }

    /// Entries after `from`, waiting up to `timeout` when there are none.
    pub async fn get(&self, from: u64, timeout: Duration) -> FeedBatch {
        // Subscribe first so an append between the check and the wait is
        // not missed.
        let mut rx = self.latest.subscribe();

        let batch = self.lock().collect(from);
        if !batch.entries.is_empty() || batch.truncated || timeout.is_zero() {
            return batch;
        }

        if tokio::time::timeout(timeout, rx.wait_for(|latest| *latest > from))
            .await
            .is_err()
        {
            debug!(from, "Feed wait timed out");
        }
        self.lock().collect(from)
    }

    /// Append a barrier for `vm` covering `ids`. Returns its sequence number.
    pub fn inject_barrier(&self, vm: &str, barrier_id: u64, ids: Vec<DynamicId>) -> Result<u64> {
        let mut log = self.lock();
        if log.barriers.contains_key(&barrier_id) {
            return Err(Error::invalid_argument(format!("barrier {} already exists", barrier_id)));
        }
        let seq = self.publish(
            &mut log,
            FeedEntry::Barrier(Barrier {
                id: barrier_id,
                vm: vm.to_string(),
                ids,
            }),
        );
        log.barriers.insert(barrier_id, seq);
        debug!(vm, barrier_id, seq, "Barrier injected");
        Ok(seq)
    }

    /// Drop a barrier that is no longer needed.
    pub fn remove_barrier(&self, barrier_id: u64) -> Result<()> {
        let mut log = self.lock();
        let seq = log
            .barriers
            .remove(&barrier_id)
            .ok_or_else(|| Error::invalid_argument(format!("unknown barrier {}", barrier_id)))?;
        log.entries.remove(&seq);
        Ok(())
    }

    /// Discard entries at or below `watermark`.
    ///
    /// Sequence numbers are never reused; watchers behind the watermark get
    /// `truncated` on their next call.
    pub fn collect_garbage(&self, watermark: u64) -> usize {
        let mut log = self.lock();
        let watermark = watermark.min(log.last_seq);
        let keep = log.entries.split_off(&(watermark + 1));
        let dropped = std::mem::replace(&mut log.entries, keep);

        for (seq, entry) in &dropped {
            log.forget(*seq, entry);
        }
        log.evicted_up_to = log.evicted_up_to.max(watermark);
        debug!(watermark, dropped = dropped.len(), "Feed garbage collected");
        dropped.len()
    }
}

impl Default for Updates {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
