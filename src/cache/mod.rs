//! Entitlement cache.

pub mod entitlement;
