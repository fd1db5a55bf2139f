//! Server-side credit metering.

pub mod ledger;
