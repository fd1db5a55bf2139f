//! Wire format of the entitlement backend.

pub mod models;
