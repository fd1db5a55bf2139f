//! Entitlement policy.

pub mod gate;
