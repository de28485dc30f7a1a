//! Payment provider boundary.
//!
//! Settlement never trusts a webhook or a client callback on its own; it asks
//! the provider for the transaction's current state through [`PaymentProvider`]
//! and acts on the tagged [`VerificationOutcome`].

pub mod metadata;
pub mod paystack;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use metadata::{normalize, normalize_value, Metadata, MetadataError};
pub use paystack::PaystackClient;

/// Transaction states the provider reports while a charge is still in flight.
const IN_FLIGHT_STATUSES: &[&str] = &["ongoing", "pending", "processing", "queued"];

/// Transport-level failure talking to the provider. Says nothing about the
/// payment itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request to provider failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("provider rejected request: {0}")]
    Rejected(String),
}

/// A transaction the provider confirmed as paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedTransaction {
    pub reference: String,
    /// Provider status string, lower-cased.
    pub status: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub currency: Option<String>,
    /// Metadata exactly as the provider sent it.
    pub metadata: Value,
}

impl VerifiedTransaction {
    pub fn normalized_metadata(&self) -> Option<Metadata> {
        normalize_value(self.metadata.clone())
    }
}

/// Result of asking the provider about a reference.
///
/// Only `ProviderFailed` allows the caller to mark the payment failed;
/// `Pending` and `TransportError` leave state untouched so the call can be retried.
#[derive(Debug, Clone, PartialEq)]
pub enum VerificationOutcome {
    Succeeded(VerifiedTransaction),
    ProviderFailed { reason: String },
    Pending { status: String },
    TransportError(ProviderError),
}

impl VerificationOutcome {
    /// Classifies a decoded provider verdict.
    pub fn from_verdict(
        envelope_ok: bool,
        message: &str,
        transaction: VerifiedTransaction,
    ) -> Self {
        if !envelope_ok {
            return VerificationOutcome::ProviderFailed {
                reason: if message.is_empty() {
                    "provider reported an unsuccessful verification".to_string()
                } else {
                    message.to_string()
                },
            };
        }

        let status = transaction.status.as_str();
        if status == "success" {
            VerificationOutcome::Succeeded(transaction)
        } else if IN_FLIGHT_STATUSES.contains(&status) {
            VerificationOutcome::Pending {
                status: transaction.status,
            }
        } else {
            VerificationOutcome::ProviderFailed {
                reason: format!("transaction status is {}", transaction.status),
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, VerificationOutcome::Succeeded(_))
    }
}

/// Request to open a transaction at the provider.
#[derive(Debug, Clone, Serialize)]
pub struct InitializeTransaction {
    pub email: String,
    /// Amount in minor currency units.
    pub amount: i64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Provider's answer to [`InitializeTransaction`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct InitializedTransaction {
    pub reference: String,
    pub authorization_url: String,
    #[serde(default)]
    pub access_code: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Opens a transaction and returns the provider reference.
    async fn initialize(
        &self,
        request: InitializeTransaction,
    ) -> Result<InitializedTransaction, ProviderError>;

    /// Re-verifies a transaction by reference.
    async fn verify(&self, reference: &str) -> VerificationOutcome;
}
