//! Live queries: push a fresh [`Snapshot`] whenever a commit may have
//! changed a query's result.

use std::sync::Arc;

use contrimeter_proto::store::{Query, Snapshot};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::database::Database;

/// A running live query. Dropping it stops the push task.
pub struct LiveQuery {
    handle: JoinHandle<()>,
}

impl LiveQuery {
    /// Spawns a task that delivers the initial snapshot of `query` to
    /// `sink`, then a new snapshot after every relevant commit.
    ///
    /// The sink returns `false` once its consumer is gone, which ends the
    /// task. A subscriber that lags behind the change feed simply re-runs
    /// the query, so no update is lost, only coalesced.
    pub fn spawn<F>(db: Arc<Database>, query: Query, mut sink: F) -> Self
    where
        F: FnMut(Snapshot) -> bool + Send + 'static,
    {
        // Subscribe before the first read so no commit slips in between.
        let mut changes = db.changes();
        let handle = tokio::spawn(async move {
            if !sink(db.query(&query)) {
                return;
            }
            loop {
                let relevant = match changes.recv().await {
                    Ok(change) => query.is_affected_by(&change),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, query = ?query, "live query lagged, re-querying");
                        true
                    }
                    Err(RecvError::Closed) => break,
                };
                if relevant && !sink(db.query(&query)) {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Stops the push task.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether the push task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
