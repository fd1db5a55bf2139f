//! # Tollgate
//!
//! **Session handling and credit-gated access to a paid AI backend.**
//!
//! Tollgate sits between an add-in's UI and its billing backend. It keeps the
//! user's bearer session alive, caches their credit balance and subscription
//! status, decides whether a paid action may run, and charges the ledger when
//! it does.
//!
//! ## Features
//!
//! - **Single-flight token refresh** - concurrent 401s share one refresh call
//! - **Credit gate** - subscription, balance, and development bypass rules in a fixed order
//! - **Entitlement cache** - optimistic decrement after a charge, reconciled by background refresh
//! - **Cost metering** - provider costs converted to credits, with a one-credit fallback
//! - **UI events** - gating outcomes and snapshot changes over a broadcast channel
//!
//! ## Quickstart
//!
//! ```no_run
//! use tollgate::{EntitlementManager, TollgateConfig, TollgateError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TollgateError> {
//!     let mut config = TollgateConfig::new("https://api.example.com/api");
//!     config.app_name = "modeler/2.1.0";
//!     config.session_namespace = Some("modeler-addin");
//!
//!     let manager = EntitlementManager::new(config)?;
//!     manager.refresh_if_stale().await?;
//!
//!     match manager.authorize("build").await {
//!         Ok(result) => println!("allowed ({})", result.reason),
//!         Err(TollgateError::InsufficientCredits { remaining, .. }) => {
//!             println!("out of credits ({} left)", remaining)
//!         }
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Trust Model
//!
//! The gate is a usage meter, not an access-control boundary. It fails open
//! while the profile is still loading and when its own evaluation faults.
//! The backend ledger is the authority on balances.
//!
//! See [`TollgateConfig`] for configuration.

#![deny(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;

// Session layer
pub mod session;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;

// Cache layer
pub mod cache;

// Policy layer
pub mod policy;

// Metering layer
pub mod meter;

// Manager (main public API)
pub mod manager;

// Re-exports for public API
pub use cache::entitlement::{AccountHolder, EntitlementSnapshot};
pub use client::refresh::SessionPhase;
pub use clock::{Clock, SystemClock};
pub use config::{Endpoints, IntegrationMode, TollgateConfig};
pub use errors::{TollgateError, UserPrompt};
pub use events::EntitlementEvent;
pub use manager::{checkout_return_urls, ConsumptionResult, EntitlementManager};
pub use meter::ledger::{DeductionReceipt, LedgerReceipt};
pub use policy::gate::{Action, GateDecision, GateReason};
pub use protocol::models::{CostReport, SubscriptionStatus, UsageAnalytics};
pub use session::store::SessionStore;

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;
