//! Payment settlement.
//!
//! Moves an order from "awaiting payment" to "paid" exactly once per payment
//! reference, no matter how many times or from how many paths (client verify,
//! provider webhook) settlement is triggered.
//!
//! Lock order is fixed: the Payment row first, then Inventory rows in order-item
//! order (`created_at`, `id`). The abandoned-order sweep in
//! [`super::order_cleanup`] takes the same locks in the same sequence through
//! [`order_items_in_lock_order`] and [`lock_inventory_for_items`].

use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    prelude::Expr,
    sea_query::{CaseStatement, Query, SimpleExpr},
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        cart::{self, CartStatus},
        cart_item, inventory, order,
        order::OrderStatus,
        order_item,
        order_merchant_split::{self, SplitStatus},
        payment::{self, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    provider::{PaymentProvider, VerificationOutcome, VerifiedTransaction},
};

/// One locked inventory row and the total quantity ordered against it.
#[derive(Debug, Clone)]
pub struct StockLine {
    pub inventory: inventory::Model,
    pub ordered: i32,
}

impl StockLine {
    pub fn quantity_after(&self) -> i32 {
        inventory::floored_decrement(self.inventory.quantity, self.ordered)
    }

    pub fn reserved_after(&self) -> i32 {
        inventory::floored_decrement(self.inventory.reserved_quantity, self.ordered)
    }
}

/// What the locked section of a settlement did.
enum Applied {
    /// Another caller settled the payment first; nothing was written.
    AlreadyCompleted(payment::Model),
    Settled(SettlementRecord),
}

struct SettlementRecord {
    payment: payment::Model,
    user_id: Uuid,
    old_order_status: OrderStatus,
    splits_advanced: u64,
    carts_converted: u64,
}

/// Service that settles verified payments.
#[derive(Clone)]
pub struct SettlementService {
    db: Arc<DatabaseConnection>,
    provider: Arc<dyn PaymentProvider>,
    event_sender: Arc<EventSender>,
}

impl SettlementService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        provider: Arc<dyn PaymentProvider>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            provider,
            event_sender,
        }
    }

    /// Settles the payment identified by the provider `reference`.
    ///
    /// # Arguments
    /// * `reference` - Provider transaction reference stored on the pending payment
    ///
    /// # Returns
    /// The completed payment. Repeated or concurrent calls return the same row
    /// and apply the side effects only once.
    ///
    /// # Errors
    /// * `VerificationFailed` when the provider reports the charge failed (payment marked failed)
    /// * `PaymentPending` / `ExternalServiceError` when the outcome is unknown (nothing changed)
    /// * `NotFound` when the payment, order or an inventory row is missing
    /// * `CommitFailure` when the transaction had to be rolled back
    #[instrument(skip(self))]
    pub async fn settle(&self, reference: &str) -> Result<payment::Model, ServiceError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ServiceError::BadRequest(
                "payment reference is required".to_string(),
            ));
        }

        let payment = find_by_reference(&*self.db, reference).await?;
        match payment.status {
            PaymentStatus::Completed => {
                counter!("settlement.duplicate", 1);
                info!(payment_id = %payment.id, "Payment already settled");
                return Ok(payment);
            }
            PaymentStatus::Failed => {
                return Err(ServiceError::InvalidStatus(format!(
                    "payment {} has already failed",
                    reference
                )));
            }
            PaymentStatus::Pending => {}
        }

        let verified = match self.provider.verify(reference).await {
            VerificationOutcome::Succeeded(transaction) => transaction,
            VerificationOutcome::ProviderFailed { reason } => {
                counter!("settlement.verification_failed", 1);
                self.mark_failed(&payment, &reason).await;
                return Err(ServiceError::VerificationFailed(reason));
            }
            VerificationOutcome::Pending { status } => {
                info!(%status, "Provider has not finished processing the payment");
                return Err(ServiceError::PaymentPending(format!(
                    "provider reports transaction {} as {}",
                    reference, status
                )));
            }
            VerificationOutcome::TransportError(cause) => {
                warn!(error = %cause, "Could not verify payment; leaving it untouched");
                return Err(ServiceError::ExternalServiceError(cause.to_string()));
            }
        };

        if verified.amount != payment.amount {
            error!(
                expected = payment.amount,
                got = verified.amount,
                "Provider amount differs from the recorded payment"
            );
            return Err(ServiceError::AmountMismatch {
                expected: payment.amount,
                got: verified.amount,
            });
        }

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
        let applied = match apply_settlement(&txn, payment.id, &verified).await {
            Ok(applied) => applied,
            Err(e) => {
                error!(error = %e, "Settlement aborted; rolling back");
                if let Err(rollback_err) = txn.rollback().await {
                    error!(error = %rollback_err, "Rollback failed");
                }
                return Err(ServiceError::commit_failure(e));
            }
        };

        txn.commit().await.map_err(|e| {
            error!(error = %e, "Settlement commit failed");
            ServiceError::CommitFailure(e.to_string())
        })?;

        match applied {
            Applied::AlreadyCompleted(payment) => {
                counter!("settlement.duplicate", 1);
                info!(payment_id = %payment.id, "Payment settled concurrently by another caller");
                Ok(payment)
            }
            Applied::Settled(record) => {
                counter!("settlement.completed", 1);
                info!(
                    payment_id = %record.payment.id,
                    order_id = %record.payment.order_id,
                    splits = record.splits_advanced,
                    carts = record.carts_converted,
                    "Payment settled"
                );
                self.notify(&record).await;
                Ok(record.payment)
            }
        }
    }

    /// Best-effort transition to `failed`, only from `pending`.
    async fn mark_failed(&self, payment: &payment::Model, reason: &str) {
        let result = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(payment::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment::Column::Id.eq(payment.id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(&*self.db)
            .await;

        match result {
            Ok(res) if res.rows_affected == 1 => {
                warn!(payment_id = %payment.id, %reason, "Payment marked failed");
                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        payment_id: payment.id,
                        reference: payment.transaction_ref.clone(),
                        reason: reason.to_string(),
                    })
                    .await;
            }
            Ok(_) => {
                info!(payment_id = %payment.id, "Payment left pending state before it could be marked failed");
            }
            Err(e) => {
                error!(payment_id = %payment.id, error = %e, "Failed to mark payment failed");
            }
        }
    }

    async fn notify(&self, record: &SettlementRecord) {
        self.event_sender
            .send_or_log(Event::PaymentCompleted {
                payment_id: record.payment.id,
                order_id: record.payment.order_id,
                reference: record.payment.transaction_ref.clone(),
            })
            .await;
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id: record.payment.order_id,
                old_status: record.old_order_status.as_str().to_string(),
                new_status: OrderStatus::Processing.as_str().to_string(),
            })
            .await;
        if record.carts_converted > 0 {
            self.event_sender
                .send_or_log(Event::CartConverted {
                    user_id: record.user_id,
                })
                .await;
        }
    }
}

/// Loads a payment by provider reference.
pub async fn find_by_reference<C: ConnectionTrait>(
    conn: &C,
    reference: &str,
) -> Result<payment::Model, ServiceError> {
    payment::Entity::find()
        .filter(payment::Column::TransactionRef.eq(reference))
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::NotFound(format!("payment with reference {} not found", reference)))
}

/// The locked section of settlement. Runs entirely inside `txn`.
async fn apply_settlement(
    txn: &DatabaseTransaction,
    payment_id: Uuid,
    verified: &VerifiedTransaction,
) -> Result<Applied, ServiceError> {
    let locked = payment::Entity::find_by_id(payment_id)
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("payment {} not found", payment_id)))?;

    match locked.status {
        PaymentStatus::Completed => return Ok(Applied::AlreadyCompleted(locked)),
        PaymentStatus::Failed => {
            return Err(ServiceError::InvalidStatus(format!(
                "payment {} was marked failed before it could be settled",
                payment_id
            )))
        }
        PaymentStatus::Pending => {}
    }

    let now = Utc::now();
    let mut payment_update: payment::ActiveModel = locked.into();
    payment_update.status = Set(PaymentStatus::Completed);
    payment_update.provider_metadata = Set(verified
        .normalized_metadata()
        .map(serde_json::Value::Object));
    payment_update.updated_at = Set(now);
    let completed = payment_update.update(txn).await?;

    let order = order::Entity::find_by_id(completed.order_id)
        .one(txn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("order {} not found", completed.order_id))
        })?;
    let items = order_items_in_lock_order(txn, order.id).await?;

    let stock = lock_inventory_for_items(txn, &items).await?;
    apply_inventory_decrements(txn, &stock, now).await?;

    let order_id = order.id;
    let user_id = order.user_id;
    let old_order_status = order.status;
    let mut order_update: order::ActiveModel = order.into();
    order_update.status = Set(OrderStatus::Processing);
    order_update.updated_at = Set(now);
    order_update.update(txn).await?;

    let splits_advanced = advance_splits(txn, order_id, now).await?;
    let carts_converted = convert_active_cart(txn, user_id, now).await?;

    Ok(Applied::Settled(SettlementRecord {
        payment: completed,
        user_id,
        old_order_status,
        splits_advanced,
        carts_converted,
    }))
}

/// Items of an order in lock order: `created_at`, then `id`.
pub async fn order_items_in_lock_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError> {
    Ok(order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .order_by_asc(order_item::Column::CreatedAt)
        .order_by_asc(order_item::Column::Id)
        .all(conn)
        .await?)
}

/// Locks the inventory row behind every order item, in item order.
///
/// Items that resolve to the same row are merged into one [`StockLine`]. A
/// missing row is an error: stock must exist for anything that was ordered.
pub async fn lock_inventory_for_items<C: ConnectionTrait>(
    conn: &C,
    items: &[order_item::Model],
) -> Result<Vec<StockLine>, ServiceError> {
    let mut lines: Vec<StockLine> = Vec::with_capacity(items.len());

    for item in items {
        let mut query = inventory::Entity::find()
            .filter(inventory::Column::MerchantId.eq(item.merchant_id));
        query = match item.variant_id {
            Some(variant_id) => query.filter(inventory::Column::VariantId.eq(variant_id)),
            None => query
                .filter(inventory::Column::ProductId.eq(item.product_id))
                .filter(inventory::Column::VariantId.is_null()),
        };

        let row = query.lock_exclusive().one(conn).await?.ok_or_else(|| {
            ServiceError::NotFound(format!(
                "inventory for merchant {} and {} not found",
                item.merchant_id,
                match item.variant_id {
                    Some(variant_id) => format!("variant {}", variant_id),
                    None => format!("product {}", item.product_id),
                }
            ))
        })?;

        match lines.iter_mut().find(|line| line.inventory.id == row.id) {
            Some(line) => line.ordered = line.ordered.saturating_add(item.quantity),
            None => lines.push(StockLine {
                inventory: row,
                ordered: item.quantity,
            }),
        }
    }

    Ok(lines)
}

/// `CASE id WHEN .. THEN max(column - ordered, 0) .. ELSE column END`
pub(crate) fn floored_decrement_expr(column: inventory::Column, lines: &[StockLine]) -> SimpleExpr {
    let mut by_row = CaseStatement::new();
    for line in lines {
        let floored = Expr::case(
            Expr::col(column).gt(line.ordered),
            Expr::col(column).sub(line.ordered),
        )
        .finally(0);
        by_row = by_row.case(inventory::Column::Id.eq(line.inventory.id), floored);
    }
    by_row.finally(Expr::col(column)).into()
}

/// Applies every decrement in one UPDATE. Both counters are floored at zero.
async fn apply_inventory_decrements<C: ConnectionTrait>(
    conn: &C,
    lines: &[StockLine],
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Ok(());
    }

    let ids: Vec<Uuid> = lines.iter().map(|line| line.inventory.id).collect();
    let result = inventory::Entity::update_many()
        .col_expr(
            inventory::Column::Quantity,
            floored_decrement_expr(inventory::Column::Quantity, lines),
        )
        .col_expr(
            inventory::Column::ReservedQuantity,
            floored_decrement_expr(inventory::Column::ReservedQuantity, lines),
        )
        .col_expr(inventory::Column::UpdatedAt, Expr::value(now))
        .filter(inventory::Column::Id.is_in(ids))
        .exec(conn)
        .await?;

    if result.rows_affected != lines.len() as u64 {
        return Err(ServiceError::CommitFailure(format!(
            "expected to update {} inventory rows, updated {}",
            lines.len(),
            result.rows_affected
        )));
    }

    for line in lines {
        let remaining = line.quantity_after();
        if line.ordered > line.inventory.quantity {
            warn!(
                inventory_id = %line.inventory.id,
                on_hand = line.inventory.quantity,
                ordered = line.ordered,
                "Ordered quantity exceeded stock; floored at zero"
            );
        } else if remaining <= line.inventory.low_stock_threshold {
            info!(
                inventory_id = %line.inventory.id,
                remaining,
                threshold = line.inventory.low_stock_threshold,
                "Inventory at or below low-stock threshold"
            );
        }
    }

    Ok(())
}

/// Set-based pending -> processing flip for every split of the order.
async fn advance_splits<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let result = order_merchant_split::Entity::update_many()
        .col_expr(
            order_merchant_split::Column::Status,
            Expr::value(SplitStatus::Processing),
        )
        .col_expr(order_merchant_split::Column::UpdatedAt, Expr::value(now))
        .filter(order_merchant_split::Column::OrderId.eq(order_id))
        .filter(order_merchant_split::Column::Status.eq(SplitStatus::Pending))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}

/// Purges the user's active cart items and marks that cart converted.
async fn convert_active_cart<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, ServiceError> {
    let active_cart_ids = Query::select()
        .column(cart::Column::Id)
        .from(cart::Entity)
        .and_where(cart::Column::UserId.eq(user_id))
        .and_where(cart::Column::Status.eq(CartStatus::Active))
        .to_owned();

    cart_item::Entity::delete_many()
        .filter(cart_item::Column::CartId.in_subquery(active_cart_ids))
        .exec(conn)
        .await?;

    let result = cart::Entity::update_many()
        .col_expr(cart::Column::Status, Expr::value(CartStatus::Converted))
        .col_expr(cart::Column::UpdatedAt, Expr::value(now))
        .filter(cart::Column::UserId.eq(user_id))
        .filter(cart::Column::Status.eq(CartStatus::Active))
        .exec(conn)
        .await?;
    Ok(result.rows_affected)
}
