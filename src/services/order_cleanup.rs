//! Abandoned-order sweep.
//!
//! Orders that stay unpaid past the configured window are cancelled and the
//! stock they reserved is handed back. Each order is handled in its own
//! transaction and takes locks in settlement order: the order's Payment rows,
//! then Inventory rows in item order. An order that settlement got to first is
//! left alone.

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use sea_orm::{
    prelude::Expr, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        inventory,
        order::{self, OrderStatus},
        payment::{self, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::settlement::{
        floored_decrement_expr, lock_inventory_for_items, order_items_in_lock_order, StockLine,
    },
};

const ABANDONED_REASON: &str = "order abandoned before payment";

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupSummary {
    pub examined: usize,
    pub cancelled: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What happened to a single candidate order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Cancelled {
        order_id: Uuid,
        released_rows: usize,
        payments_failed: usize,
    },
    /// Paid, settled or no longer stale by the time its locks were held.
    Skipped { order_id: Uuid },
}

struct Cancellation {
    order_id: Uuid,
    released_rows: usize,
    failed_payments: Vec<payment::Model>,
}

#[derive(Clone)]
pub struct OrderCleanupService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    ttl: Duration,
}

impl OrderCleanupService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>, ttl: Duration) -> Self {
        Self {
            db,
            event_sender,
            ttl,
        }
    }

    /// Cancels every pending order created before `now - ttl`.
    ///
    /// A failure on one order is logged and the sweep moves on; only the
    /// initial candidate query can fail the whole run.
    #[instrument(skip(self))]
    pub async fn cleanup_abandoned_orders(&self) -> Result<CleanupSummary, ServiceError> {
        let cutoff = Utc::now() - self.ttl;
        let candidates: Vec<Uuid> = order::Entity::find()
            .select_only()
            .column(order::Column::Id)
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .order_by_asc(order::Column::CreatedAt)
            .into_tuple()
            .all(&*self.db)
            .await?;

        let mut summary = CleanupSummary {
            examined: candidates.len(),
            ..CleanupSummary::default()
        };
        if candidates.is_empty() {
            debug!("No abandoned orders found");
            return Ok(summary);
        }

        for order_id in candidates {
            match self.cancel_abandoned_order(order_id, cutoff).await {
                Ok(CleanupOutcome::Cancelled { .. }) => summary.cancelled += 1,
                Ok(CleanupOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(%order_id, error = %e, "Failed to clean up abandoned order");
                }
            }
        }

        info!(
            cancelled = summary.cancelled,
            skipped = summary.skipped,
            failed = summary.failed,
            "Abandoned order cleanup completed"
        );
        Ok(summary)
    }

    /// Cancels one order if it is still pending, unpaid and older than `cutoff`.
    #[instrument(skip(self))]
    pub async fn cancel_abandoned_order(
        &self,
        order_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<CleanupOutcome, ServiceError> {
        let txn = self.db.begin().await?;
        let cancellation = match cancel_locked(&txn, order_id, cutoff).await {
            Ok(Some(cancellation)) => cancellation,
            Ok(None) => {
                txn.rollback().await?;
                return Ok(CleanupOutcome::Skipped { order_id });
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    error!(error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        };
        txn.commit().await?;

        counter!("order_cleanup.cancelled", 1);
        info!(
            %order_id,
            released_rows = cancellation.released_rows,
            payments_failed = cancellation.failed_payments.len(),
            "Abandoned order cancelled"
        );
        self.notify(&cancellation).await;

        Ok(CleanupOutcome::Cancelled {
            order_id,
            released_rows: cancellation.released_rows,
            payments_failed: cancellation.failed_payments.len(),
        })
    }

    async fn notify(&self, cancellation: &Cancellation) {
        self.event_sender
            .send_or_log(Event::OrderStatusChanged {
                order_id: cancellation.order_id,
                old_status: OrderStatus::Pending.as_str().to_string(),
                new_status: OrderStatus::Cancelled.as_str().to_string(),
            })
            .await;
        for payment in &cancellation.failed_payments {
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    payment_id: payment.id,
                    reference: payment.transaction_ref.clone(),
                    reason: ABANDONED_REASON.to_string(),
                })
                .await;
        }
    }
}

/// Locked section of a cancellation. `None` means the order must be left alone.
async fn cancel_locked(
    txn: &DatabaseTransaction,
    order_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<Option<Cancellation>, ServiceError> {
    let payments = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .order_by_asc(payment::Column::CreatedAt)
        .order_by_asc(payment::Column::Id)
        .lock_exclusive()
        .all(txn)
        .await?;
    if payments
        .iter()
        .any(|p| p.status == PaymentStatus::Completed)
    {
        debug!(%order_id, "Order was paid; skipping");
        return Ok(None);
    }

    let Some(order) = order::Entity::find_by_id(order_id).one(txn).await? else {
        return Err(ServiceError::NotFound(format!("order {} not found", order_id)));
    };
    if order.status != OrderStatus::Pending || order.created_at >= cutoff {
        debug!(%order_id, status = order.status.as_str(), "Order no longer abandoned; skipping");
        return Ok(None);
    }

    let items = order_items_in_lock_order(txn, order_id).await?;
    let stock = lock_inventory_for_items(txn, &items).await?;
    release_reservations(txn, &stock).await?;

    let now = Utc::now();
    let failed_payments: Vec<payment::Model> = payments
        .into_iter()
        .filter(|p| p.status == PaymentStatus::Pending)
        .collect();
    if !failed_payments.is_empty() {
        payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentStatus::Failed))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .exec(txn)
            .await?;
    }

    let cancelled = order::Entity::update_many()
        .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
        .col_expr(order::Column::UpdatedAt, Expr::value(now))
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(OrderStatus::Pending))
        .exec(txn)
        .await?;
    if cancelled.rows_affected != 1 {
        return Err(ServiceError::InvalidStatus(format!(
            "order {} left pending state during cleanup",
            order_id
        )));
    }

    Ok(Some(Cancellation {
        order_id,
        released_rows: stock.len(),
        failed_payments,
    }))
}

/// Gives back reserved stock in one UPDATE, floored at zero.
async fn release_reservations(
    txn: &DatabaseTransaction,
    lines: &[StockLine],
) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Ok(());
    }
    for line in lines.iter().filter(|l| l.ordered > l.inventory.reserved_quantity) {
        warn!(
            inventory_id = %line.inventory.id,
            reserved = line.inventory.reserved_quantity,
            ordered = line.ordered,
            "Releasing more than was reserved; floored at zero"
        );
    }

    let ids: Vec<Uuid> = lines.iter().map(|line| line.inventory.id).collect();
    inventory::Entity::update_many()
        .col_expr(
            inventory::Column::ReservedQuantity,
            floored_decrement_expr(inventory::Column::ReservedQuantity, lines),
        )
        .col_expr(inventory::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(inventory::Column::Id.is_in(ids))
        .exec(txn)
        .await?;
    Ok(())
}

/// Runs the sweep on a fixed interval until the task is dropped.
pub async fn run_cleanup_task(service: OrderCleanupService, interval: std::time::Duration) {
    info!(?interval, "Starting abandoned order cleanup task");
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        interval_timer.tick().await;
        if let Err(e) = service.cleanup_abandoned_orders().await {
            error!(error = %e, "Abandoned order sweep failed");
        }
    }
}
