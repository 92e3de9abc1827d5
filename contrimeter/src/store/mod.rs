//! Document store seam for `Contrimeter` clients.
//!
//! Defines the [`DocumentStore`] trait every store backend must satisfy.
//! Concrete implementations include:
//! - [`embedded::EmbeddedStore`] -- in-process database, used for tests and
//!   single-process setups
//! - [`remote::RemoteStore`] -- WebSocket client for a `contrimeter-store`
//!   server

pub mod embedded;
pub mod remote;

use std::future::Future;

use contrimeter_proto::model::{
    ChatMessage, Contribution, Session, Task, Team, UserProfile,
};
use contrimeter_proto::store::{Query, Snapshot, StoreFailure, WriteBatch};
use tokio::sync::mpsc;

pub use embedded::EmbeddedStore;
pub use remote::RemoteStore;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store refused the request.
    #[error(transparent)]
    Rejected(#[from] StoreFailure),

    /// The connection to the store has been closed.
    #[error("connection to store closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("store operation timed out")]
    Timeout,

    /// The store could not be reached.
    #[error("store {url} is unreachable: {reason}")]
    Unreachable {
        /// Store URL.
        url: String,
        /// Underlying cause.
        reason: String,
    },

    /// The store answered with a snapshot of the wrong kind.
    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        /// What the caller asked for.
        expected: &'static str,
        /// What arrived.
        got: String,
    },

    /// Encoding or transport failure.
    #[error("store I/O error: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether a write was refused because a precondition did not hold.
    #[must_use]
    pub const fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::Rejected(StoreFailure::PreconditionFailed(_)))
    }

    /// Whether a referenced document does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Rejected(StoreFailure::NotFound(_)))
    }

    /// Whether a document that must not exist already does.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Rejected(StoreFailure::Conflict(_)))
    }
}

/// A live query: yields a fresh [`Snapshot`] every time the result may
/// have changed. Dropping it cancels the subscription.
pub struct Subscription {
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps a snapshot channel and a cancellation hook run on drop.
    #[must_use]
    pub fn new(
        snapshots: mpsc::UnboundedReceiver<Snapshot>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            snapshots,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Waits for the next snapshot. `None` once the store connection is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.snapshots.recv().await
    }

    /// Returns a snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<Snapshot> {
        self.snapshots.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Async document store: atomic batch commits, one-shot queries and live
/// queries.
///
/// Every mutation goes through [`DocumentStore::commit`]; a batch either
/// applies completely or not at all, and conditional writes inside it fail
/// with [`StoreFailure::PreconditionFailed`] instead of overwriting.
pub trait DocumentStore: Send + Sync {
    /// Atomically applies a write batch.
    fn commit(
        &self,
        batch: WriteBatch,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Runs a query once.
    fn query(&self, query: Query) -> impl Future<Output = Result<Snapshot, StoreError>> + Send;

    /// Starts a live query. The initial snapshot is delivered first.
    fn subscribe(
        &self,
        query: Query,
    ) -> impl Future<Output = Result<Subscription, StoreError>> + Send;
}

fn unexpected(expected: &'static str, got: &Snapshot) -> StoreError {
    StoreError::UnexpectedReply {
        expected,
        got: got.kind().to_string(),
    }
}

/// Unwraps a [`Snapshot::Team`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_team(snapshot: Snapshot) -> Result<Option<Team>, StoreError> {
    match snapshot {
        Snapshot::Team(team) => Ok(team),
        other => Err(unexpected("team", &other)),
    }
}

/// Unwraps a [`Snapshot::Teams`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_teams(snapshot: Snapshot) -> Result<Vec<Team>, StoreError> {
    match snapshot {
        Snapshot::Teams(teams) => Ok(teams),
        other => Err(unexpected("teams", &other)),
    }
}

/// Unwraps a [`Snapshot::User`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_user(snapshot: Snapshot) -> Result<Option<UserProfile>, StoreError> {
    match snapshot {
        Snapshot::User(profile) => Ok(profile),
        other => Err(unexpected("user", &other)),
    }
}

/// Unwraps a [`Snapshot::Task`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_task(snapshot: Snapshot) -> Result<Option<Task>, StoreError> {
    match snapshot {
        Snapshot::Task(task) => Ok(task),
        other => Err(unexpected("task", &other)),
    }
}

/// Unwraps a [`Snapshot::Tasks`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_tasks(snapshot: Snapshot) -> Result<Vec<Task>, StoreError> {
    match snapshot {
        Snapshot::Tasks(tasks) => Ok(tasks),
        other => Err(unexpected("tasks", &other)),
    }
}

/// Unwraps a [`Snapshot::Contributions`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_contributions(snapshot: Snapshot) -> Result<Vec<Contribution>, StoreError> {
    match snapshot {
        Snapshot::Contributions(rows) => Ok(rows),
        other => Err(unexpected("contributions", &other)),
    }
}

/// Unwraps a [`Snapshot::Sessions`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_sessions(snapshot: Snapshot) -> Result<Vec<Session>, StoreError> {
    match snapshot {
        Snapshot::Sessions(rows) => Ok(rows),
        other => Err(unexpected("sessions", &other)),
    }
}

/// Unwraps a [`Snapshot::Messages`].
///
/// # Errors
///
/// Returns [`StoreError::UnexpectedReply`] for any other snapshot kind.
pub fn into_messages(snapshot: Snapshot) -> Result<Vec<ChatMessage>, StoreError> {
    match snapshot {
        Snapshot::Messages(rows) => Ok(rows),
        other => Err(unexpected("messages", &other)),
    }
}
