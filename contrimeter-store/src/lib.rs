//! `Contrimeter` document store library.
//!
//! Exposes the in-memory document database, live queries and the
//! WebSocket/HTTP server for use in tests and embedding. Clients mutate
//! documents through atomic write batches and keep views current through
//! live-query subscriptions.

pub mod config;
pub mod database;
pub mod live;
pub mod server;
pub mod token;
