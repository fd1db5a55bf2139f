//! Session credential storage.

pub mod store;
