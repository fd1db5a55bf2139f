//! Credit ledger client.
//!
//! Charges the server-side balance. `consume` takes one credit per action;
//! `deduct` converts a provider cost into credits and falls back to a single
//! `consume("api_call")` when the deduct endpoint misbehaves and the cost is
//! worth at least half a credit.

use crate::client::http::{RequestOptions, Transport};
use crate::config::Endpoints;
use crate::policy::gate::Action;
use crate::protocol::models::{CostReport, DeductResponse, UseCreditRequest, UseCreditResponse};
use crate::TollgateError;
use std::sync::Arc;
use tracing::{debug, warn};

/// USD value of one credit.
pub const USD_PER_CREDIT: f64 = 0.05;

/// Smallest cost that is still charged through the fallback path.
pub const FALLBACK_MIN_COST_USD: f64 = 0.025;

const FALLBACK_ACTION: &str = "api_call";

/// Credits a provider cost is worth.
pub fn credits_for_cost(cost_usd: f64) -> f64 {
    cost_usd / USD_PER_CREDIT
}

/// Server acknowledgement of `credits/use`.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerReceipt {
    /// Always true for a returned receipt.
    pub success: bool,
    /// Authoritative balance, when the server reported one.
    pub remaining_credits: Option<f64>,
}

/// Outcome of a cost-based charge.
#[derive(Debug, Clone, PartialEq)]
pub struct DeductionReceipt {
    /// Credits charged.
    pub credit_cost: f64,
    /// Authoritative balance, when the server reported one.
    pub remaining_credits: Option<f64>,
    /// Charged through `credits/use` after `credits/deduct` failed.
    pub via_fallback: bool,
}

/// Client for the `credits/*` endpoints.
pub struct LedgerClient {
    transport: Arc<Transport>,
    endpoints: Endpoints,
}

impl LedgerClient {
    /// Ledger client over a shared transport.
    pub fn new(transport: Arc<Transport>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    /// Consume one credit for `action`.
    ///
    /// Not idempotent; callers must not retry blindly.
    pub async fn consume(&self, action: &Action) -> Result<LedgerReceipt, TollgateError> {
        let options = RequestOptions::post().json(&UseCreditRequest {
            action: action.as_str(),
        })?;
        let response = self
            .transport
            .send(self.endpoints.credits_use, options)
            .await?;
        let body: UseCreditResponse = response.json()?;

        if !body.success {
            return Err(TollgateError::Request {
                status: response.status,
                message: Some(body.error.unwrap_or_else(|| "Failed to use credit".to_string())),
            });
        }

        debug!(action = %action, remaining = ?body.remaining_credits, "credit consumed");
        Ok(LedgerReceipt {
            success: true,
            remaining_credits: body.remaining_credits,
        })
    }

    /// Charge the credit equivalent of a provider call.
    ///
    /// Falls back to [`consume`](Self::consume) only when the deduct call
    /// fails with a request or protocol error and `report.cost` is at least
    /// [`FALLBACK_MIN_COST_USD`]. Balance, auth, and network errors propagate.
    pub async fn deduct(&self, report: &CostReport) -> Result<DeductionReceipt, TollgateError> {
        match self.deduct_once(report).await {
            Ok(receipt) => Ok(receipt),
            Err(e @ (TollgateError::Request { .. } | TollgateError::Protocol(_)))
                if report.cost >= FALLBACK_MIN_COST_USD =>
            {
                warn!(
                    error = %e,
                    cost = report.cost,
                    provider = %report.provider,
                    "cost deduction failed, charging one credit instead"
                );
                let receipt = self.consume(&Action::new(FALLBACK_ACTION)).await?;
                Ok(DeductionReceipt {
                    credit_cost: 1.0,
                    remaining_credits: receipt.remaining_credits,
                    via_fallback: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn deduct_once(&self, report: &CostReport) -> Result<DeductionReceipt, TollgateError> {
        let options = RequestOptions::post().json(report)?;
        let response = self
            .transport
            .send(self.endpoints.credits_deduct, options)
            .await?;
        let body: DeductResponse = response.json()?;

        if !body.success {
            return Err(TollgateError::Request {
                status: response.status,
                message: Some(body.error.unwrap_or_else(|| "Failed to deduct credits".to_string())),
            });
        }

        let credit_cost = body
            .credit_cost
            .unwrap_or_else(|| credits_for_cost(report.cost));
        debug!(
            action = %report.action,
            credit_cost,
            remaining = ?body.remaining_credits,
            "cost deducted"
        );
        Ok(DeductionReceipt {
            credit_cost,
            remaining_credits: body.remaining_credits,
            via_fallback: false,
        })
    }
}
