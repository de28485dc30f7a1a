use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, JoinType, QueryFilter,
    QueryOrder, QuerySelect, RelationTrait, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    entities::{
        order::{self, OrderStatus},
        payment::{self, PaymentStatus},
    },
    errors::ServiceError,
    provider::{InitializeTransaction, PaymentProvider},
    services::reconciliation,
};

/// Checkout request sent by the client after the order is created.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InitializePaymentRequest {
    pub order_id: Uuid,
    /// Amount the client believes it is paying, in major units.
    #[validate(custom = "validate_declared_amount")]
    pub amount: f64,
    #[validate(email)]
    pub email: String,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
}

fn validate_declared_amount(amount: f64) -> Result<(), validator::ValidationError> {
    if amount.is_finite() && amount > 0.0 {
        Ok(())
    } else {
        Err(validator::ValidationError::new("amount_must_be_positive"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub reference: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<payment::Model> for PaymentResponse {
    fn from(model: payment::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            reference: model.transaction_ref,
            amount: model.amount,
            currency: model.currency,
            status: model.status,
            authorization_url: None,
            provider_metadata: model.provider_metadata,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

/// Opens provider transactions and answers payment lookups.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    provider: Arc<dyn PaymentProvider>,
    default_currency: String,
    callback_url: Option<String>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        provider: Arc<dyn PaymentProvider>,
        default_currency: impl Into<String>,
        callback_url: Option<String>,
    ) -> Self {
        Self {
            db,
            provider,
            default_currency: default_currency.into(),
            callback_url,
        }
    }

    /// Reconciles the declared amount against the order, opens a provider
    /// transaction and records a pending payment for its reference.
    #[instrument(skip(self, request), fields(order_id = %request.order_id))]
    pub async fn initialize_checkout(
        &self,
        request: InitializePaymentRequest,
    ) -> Result<PaymentResponse, ServiceError> {
        request.validate()?;

        let order = order::Entity::find_by_id(request.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", request.order_id)))?;

        if order.status != OrderStatus::Pending {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} is {} and cannot be paid",
                order.id,
                order.status.as_str()
            )));
        }

        let amount = reconciliation::reconcile(order.sub_total, request.amount)?;

        let open = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.is_in([PaymentStatus::Pending, PaymentStatus::Completed]))
            .one(&*self.db)
            .await?;
        if let Some(existing) = open {
            return Err(ServiceError::InvalidStatus(format!(
                "order {} already has a {:?} payment",
                order.id, existing.status
            )));
        }

        let currency = request
            .currency
            .map(|c| c.to_ascii_uppercase())
            .or_else(|| (!order.currency.is_empty()).then(|| order.currency.clone()))
            .unwrap_or_else(|| self.default_currency.clone());

        let opened = self
            .provider
            .initialize(InitializeTransaction {
                email: request.email,
                amount,
                currency: currency.clone(),
                callback_url: self.callback_url.clone(),
                metadata: Some(serde_json::json!({ "order_id": order.id })),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "Provider refused to open transaction");
                ServiceError::ExternalServiceError(e.to_string())
            })?;

        if opened.reference.trim().is_empty() {
            return Err(ServiceError::ExternalServiceError(
                "provider returned an empty transaction reference".to_string(),
            ));
        }

        let now = Utc::now();
        let record = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            amount: Set(amount),
            currency: Set(currency),
            status: Set(PaymentStatus::Pending),
            transaction_ref: Set(opened.reference),
            provider_metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        info!(payment_id = %record.id, reference = %record.transaction_ref, amount, "Checkout initialized");

        let mut response = PaymentResponse::from(record);
        response.authorization_url = Some(opened.authorization_url);
        Ok(response)
    }

    /// Latest payment recorded for an order.
    pub async fn payment_for_order(&self, order_id: Uuid) -> Result<payment::Model, ServiceError> {
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No payment for order {}", order_id)))
    }

    /// All payments for a user's orders, newest first.
    pub async fn payments_for_user(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<payment::Model>, ServiceError> {
        let payments = payment::Entity::find()
            .join(JoinType::InnerJoin, payment::Relation::Order.def())
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(payment::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(amount: f64, email: &str, currency: Option<&str>) -> InitializePaymentRequest {
        InitializePaymentRequest {
            order_id: Uuid::new_v4(),
            amount,
            email: email.to_string(),
            currency: currency.map(str::to_string),
        }
    }

    #[test]
    fn request_validation() {
        assert!(request(30000.0, "buyer@example.com", Some("NGN")).validate().is_ok());
        assert!(request(30000.0, "buyer@example.com", None).validate().is_ok());
        assert!(request(0.0, "buyer@example.com", None).validate().is_err());
        assert!(request(-5.0, "buyer@example.com", None).validate().is_err());
        assert!(request(f64::NAN, "buyer@example.com", None).validate().is_err());
        assert!(request(10.0, "not-an-email", None).validate().is_err());
        assert!(request(10.0, "buyer@example.com", Some("NAIRA")).validate().is_err());
    }
}
