use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    InitializeTransaction, InitializedTransaction, PaymentProvider, ProviderError,
    VerificationOutcome, VerifiedTransaction,
};

/// Upper bound on how much of an error body is kept for diagnostics.
const MAX_ERROR_BODY_BYTES: usize = 8192;

/// Response envelope shared by every Paystack endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    status: String,
    reference: String,
    amount: i64,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    gateway_response: Option<String>,
    #[serde(default)]
    metadata: Value,
}

/// HTTP client for the Paystack transaction API.
#[derive(Clone)]
pub struct PaystackClient {
    client: reqwest::Client,
    base_url: Url,
    secret_key: String,
}

impl PaystackClient {
    pub fn new(
        base_url: &str,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Request(format!("invalid base url {}: {}", base_url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            secret_key: secret_key.into(),
        })
    }

    pub fn from_config(cfg: &crate::config::AppConfig) -> Result<Self, ProviderError> {
        Self::new(
            &cfg.paystack_base_url,
            cfg.paystack_secret_key.clone(),
            cfg.provider_timeout(),
        )
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Request("provider base url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Envelope<T>, ProviderError> {
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::UnexpectedStatus {
                status: status.as_u16(),
                body: truncate(body),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY_BYTES {
        let mut cut = MAX_ERROR_BODY_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl PaymentProvider for PaystackClient {
    #[instrument(skip(self, request), fields(amount = request.amount, currency = %request.currency))]
    async fn initialize(
        &self,
        request: InitializeTransaction,
    ) -> Result<InitializedTransaction, ProviderError> {
        let url = self.endpoint(&["transaction", "initialize"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.secret_key)
            .header(header::ACCEPT, "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let envelope: Envelope<InitializedTransaction> = Self::read_envelope(response).await?;
        if !envelope.status {
            return Err(ProviderError::Rejected(envelope.message));
        }
        envelope
            .data
            .ok_or_else(|| ProviderError::Decode("initialize response carried no data".into()))
    }

    #[instrument(skip(self))]
    async fn verify(&self, reference: &str) -> VerificationOutcome {
        let url = match self.endpoint(&["transaction", "verify", reference]) {
            Ok(url) => url,
            Err(e) => return VerificationOutcome::TransportError(e),
        };

        let response = match self
            .client
            .get(url)
            .bearer_auth(&self.secret_key)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Provider verification request failed");
                return VerificationOutcome::TransportError(ProviderError::Request(e.to_string()));
            }
        };

        let envelope: Envelope<TransactionData> = match Self::read_envelope(response).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Provider verification response unusable");
                return VerificationOutcome::TransportError(e);
            }
        };

        let Some(data) = envelope.data else {
            if envelope.status {
                return VerificationOutcome::TransportError(ProviderError::Decode(
                    "verify response carried no data".into(),
                ));
            }
            return VerificationOutcome::ProviderFailed {
                reason: envelope.message,
            };
        };

        debug!(
            status = %data.status,
            gateway_response = data.gateway_response.as_deref().unwrap_or(""),
            "Provider verification decoded"
        );

        VerificationOutcome::from_verdict(
            envelope.status,
            &envelope.message,
            VerifiedTransaction {
                reference: data.reference,
                status: data.status.to_ascii_lowercase(),
                amount: data.amount,
                currency: data.currency,
                metadata: data.metadata,
            },
        )
    }
}
