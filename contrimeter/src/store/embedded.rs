//! In-process document store.
//!
//! Wraps a shared [`Database`] directly, without any network hop. Several
//! [`EmbeddedStore`] handles cloned from the same database behave like
//! several devices connected to one server, which is how the multi-actor
//! tests drive concurrent clients.

use std::sync::Arc;

use contrimeter_proto::store::{Query, Snapshot, WriteBatch};
use contrimeter_store::database::Database;
use contrimeter_store::live::LiveQuery;
use contrimeter_store::token::TokenMinter;
use tokio::sync::mpsc;

use super::{DocumentStore, StoreError, Subscription};

/// Document store backed by an in-process [`Database`].
#[derive(Clone)]
pub struct EmbeddedStore {
    db: Arc<Database>,
    minter: Option<TokenMinter>,
}

impl Default for EmbeddedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddedStore {
    /// Creates a store over a fresh, empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::from_database(Arc::new(Database::new()))
    }

    /// Creates a store handle over an existing database.
    #[must_use]
    pub const fn from_database(db: Arc<Database>) -> Self {
        Self { db, minter: None }
    }

    /// Attaches a call token minter.
    #[must_use]
    pub fn with_minter(mut self, minter: TokenMinter) -> Self {
        self.minter = Some(minter);
        self
    }

    /// The underlying database.
    #[must_use]
    pub const fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// The attached token minter, if any.
    #[must_use]
    pub const fn minter(&self) -> Option<&TokenMinter> {
        self.minter.as_ref()
    }
}

impl DocumentStore for EmbeddedStore {
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.db.commit(&batch).map_err(StoreError::from)
    }

    async fn query(&self, query: Query) -> Result<Snapshot, StoreError> {
        Ok(self.db.query(&query))
    }

    async fn subscribe(&self, query: Query) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let live = LiveQuery::spawn(Arc::clone(&self.db), query, move |snapshot| {
            tx.send(snapshot).is_ok()
        });
        Ok(Subscription::new(rx, move || live.abort()))
    }
}
