//! Routes provider webhook events to settlement and payout handling.
//!
//! A webhook is only a hint. `charge.success` never settles anything by
//! itself; it triggers the same provider re-verification the client path uses.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::payment,
    errors::ServiceError,
    services::{payouts::PayoutService, settlement::SettlementService},
};

const CHARGE_SUCCESS: &str = "charge.success";
const TRANSFER_SUCCESS: &str = "transfer.success";
const TRANSFER_FAILED: &str = "transfer.failed";
const TRANSFER_REVERSED: &str = "transfer.reversed";

/// Charge statuses a `charge.success` payload may carry.
const KNOWN_CHARGE_STATUSES: &[&str] = &["success", "failed", "abandoned"];

/// What a delivered event led to.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Settled(payment::Model),
    PayoutCompleted(Uuid),
    PayoutFailed(Uuid),
    /// Event type with no handler; acknowledged so the provider stops retrying.
    Ignored(String),
}

#[derive(Clone)]
pub struct WebhookDispatcher {
    settlement: Arc<SettlementService>,
    payouts: Arc<PayoutService>,
}

impl WebhookDispatcher {
    pub fn new(settlement: Arc<SettlementService>, payouts: Arc<PayoutService>) -> Self {
        Self {
            settlement,
            payouts,
        }
    }

    /// Dispatches a parsed webhook envelope `{ "event": .., "data": { .. } }`.
    #[instrument(skip(self, envelope))]
    pub async fn dispatch(&self, envelope: &Value) -> Result<WebhookOutcome, ServiceError> {
        let event = envelope
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::MalformedWebhook("event must be a string".to_string()))?;
        let data = envelope
            .get("data")
            .and_then(Value::as_object)
            .ok_or_else(|| ServiceError::MalformedWebhook("data must be an object".to_string()))?;

        match event {
            CHARGE_SUCCESS => self.charge_success(data).await,
            TRANSFER_SUCCESS => {
                let code = transfer_code(data)?;
                let result = self.payouts.apply_transfer_success(code).await?;
                Ok(WebhookOutcome::PayoutCompleted(result.payout_id()))
            }
            TRANSFER_FAILED | TRANSFER_REVERSED => {
                let code = transfer_code(data)?;
                let result = self
                    .payouts
                    .apply_transfer_failure(code, event == TRANSFER_REVERSED)
                    .await?;
                Ok(WebhookOutcome::PayoutFailed(result.payout_id()))
            }
            other => {
                info!(event = other, "Ignoring unhandled webhook event");
                Ok(WebhookOutcome::Ignored(other.to_string()))
            }
        }
    }

    async fn charge_success(&self, data: &Map<String, Value>) -> Result<WebhookOutcome, ServiceError> {
        let status = required_str(data, "status")?;
        if !KNOWN_CHARGE_STATUSES.contains(&status) {
            return Err(ServiceError::MalformedWebhook(format!(
                "unknown charge status {}",
                status
            )));
        }
        let reference = required_str(data, "reference")?;

        if status != "success" {
            warn!(%reference, %status, "Charge event does not report success; not settling");
            return Err(ServiceError::VerificationFailed(format!(
                "charge {} reported {}",
                reference, status
            )));
        }

        let payment = self.settlement.settle(reference).await?;
        Ok(WebhookOutcome::Settled(payment))
    }
}

fn required_str<'a>(data: &'a Map<String, Value>, key: &str) -> Result<&'a str, ServiceError> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ServiceError::MalformedWebhook(format!("data.{} must be a non-empty string", key)))
}

fn transfer_code(data: &Map<String, Value>) -> Result<&str, ServiceError> {
    required_str(data, "transfer_code")
}
