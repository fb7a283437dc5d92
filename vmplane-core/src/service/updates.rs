//! Update feed operations.

use std::time::Duration;

use tracing::{debug, instrument};

use super::NodeService;
use crate::error::Result;
use crate::updates::FeedBatch;

impl NodeService {
    /// Entries after `from`, blocking up to `timeout` when there are none.
    pub async fn get_updates(&self, from: u64, timeout: Duration) -> FeedBatch {
        self.feed().get(from, timeout).await
    }

    /// Sequence number of the newest entry.
    pub fn last_update_id(&self) -> u64 {
        self.feed().last_id()
    }

    /// Mark the feed position for `vm`. Every change to the VM or its
    /// devices made before this call appears before the barrier.
    #[instrument(skip(self))]
    pub fn inject_barrier(&self, vm: &str, barrier_id: u64) -> Result<u64> {
        self.store()
            .with_vm_ids(vm, |ids| self.feed().inject_barrier(vm, barrier_id, ids))
    }

    #[instrument(skip(self))]
    pub fn remove_barrier(&self, barrier_id: u64) -> Result<()> {
        self.feed().remove_barrier(barrier_id)
    }

    /// Re-publish the VM and its devices so watchers can resynchronise.
    #[instrument(skip(self))]
    pub fn refresh_vm(&self, vm: &str) -> Result<()> {
        self.store().refresh_vm(vm)
    }

    /// Drop feed entries at or below `watermark`.
    pub fn collect_garbage(&self, watermark: u64) -> usize {
        let dropped = self.feed().collect_garbage(watermark);
        debug!(watermark, dropped, "Update feed trimmed");
        dropped
    }
}
