//! `Contrimeter` -- team task, timer and contribution tracking library.

pub mod call;
pub mod chat;
pub mod config;
pub mod contributions;
pub mod sessions;
pub mod store;
pub mod tasks;
pub mod teams;
pub mod timer;
pub mod users;
