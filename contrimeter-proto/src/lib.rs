//! Shared document model and wire protocol for `Contrimeter`.

pub mod call;
pub mod model;
pub mod store;
