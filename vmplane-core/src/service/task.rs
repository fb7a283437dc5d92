//! Task queries and control.

use std::time::Duration;

use tracing::instrument;

use super::NodeService;
use crate::error::Result;
use crate::model::TaskInfo;

impl NodeService {
    pub fn stat_task(&self, id: &str) -> Result<TaskInfo> {
        self.tasks().stat(id)
    }

    pub fn list_tasks(&self) -> Vec<TaskInfo> {
        self.tasks().list()
    }

    /// Wait up to `timeout` for the task to finish and return its snapshot.
    pub async fn wait_task(&self, id: &str, timeout: Duration) -> Result<TaskInfo> {
        self.tasks().wait(id, timeout).await
    }

    #[instrument(skip(self))]
    pub fn cancel_task(&self, dbg: &str, id: &str) -> Result<()> {
        self.tasks().cancel(id)
    }

    #[instrument(skip(self))]
    pub fn destroy_task(&self, dbg: &str, id: &str) -> Result<()> {
        self.tasks().destroy(id)
    }
}
