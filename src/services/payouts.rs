use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    prelude::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        merchant,
        order_merchant_split::{self, SplitStatus},
        payout::{self, PayoutStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Funds a merchant may withdraw right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerchantBalance {
    pub merchant_id: Uuid,
    /// Processing splits whose hold has expired.
    pub available: Decimal,
    /// Processing splits still inside their hold window.
    pub on_hold: Decimal,
    pub total_payouts: Decimal,
}

/// Effect of a transfer webhook on one payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Applied { payout_id: Uuid, merchant_id: Uuid },
    AlreadyApplied { payout_id: Uuid },
}

impl TransferResult {
    pub fn payout_id(&self) -> Uuid {
        match self {
            TransferResult::Applied { payout_id, .. } => *payout_id,
            TransferResult::AlreadyApplied { payout_id } => *payout_id,
        }
    }
}

/// Applies provider transfer outcomes to payouts and merchant totals.
#[derive(Clone)]
pub struct PayoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl PayoutService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Marks the payout completed and adds its amount to the merchant's total.
    ///
    /// A replayed webhook finds the payout already completed and changes nothing.
    #[instrument(skip(self))]
    pub async fn apply_transfer_success(
        &self,
        transfer_code: &str,
    ) -> Result<TransferResult, ServiceError> {
        let txn = self.db.begin().await?;
        let payout = lock_payout(&txn, transfer_code).await?;

        match payout.status {
            PayoutStatus::Completed => {
                txn.commit().await?;
                info!(payout_id = %payout.id, "Transfer success already applied");
                return Ok(TransferResult::AlreadyApplied {
                    payout_id: payout.id,
                });
            }
            PayoutStatus::Failed => {
                txn.rollback().await?;
                return Err(ServiceError::InvalidStatus(format!(
                    "payout {} already failed",
                    payout.id
                )));
            }
            PayoutStatus::Pending => {}
        }

        let payout_id = payout.id;
        let merchant_id = payout.merchant_id;
        let amount = payout.amount;

        let mut update: payout::ActiveModel = payout.into();
        update.status = Set(PayoutStatus::Completed);
        update.update(&txn).await?;
        adjust_total_payouts(&txn, merchant_id, amount).await?;

        txn.commit().await?;
        info!(%payout_id, %merchant_id, %amount, "Payout completed");
        self.event_sender
            .send_or_log(Event::PayoutCompleted {
                payout_id,
                merchant_id,
            })
            .await;

        Ok(TransferResult::Applied {
            payout_id,
            merchant_id,
        })
    }

    /// Marks the payout failed. A reversal of a completed payout also takes the
    /// amount back out of the merchant's total.
    #[instrument(skip(self))]
    pub async fn apply_transfer_failure(
        &self,
        transfer_code: &str,
        reversed: bool,
    ) -> Result<TransferResult, ServiceError> {
        let txn = self.db.begin().await?;
        let payout = lock_payout(&txn, transfer_code).await?;

        let was_completed = match payout.status {
            PayoutStatus::Failed => {
                txn.commit().await?;
                info!(payout_id = %payout.id, "Transfer failure already applied");
                return Ok(TransferResult::AlreadyApplied {
                    payout_id: payout.id,
                });
            }
            PayoutStatus::Completed if !reversed => {
                txn.rollback().await?;
                warn!(payout_id = %payout.id, "Ignoring transfer failure for a completed payout");
                return Err(ServiceError::InvalidStatus(format!(
                    "payout {} is already completed",
                    payout.id
                )));
            }
            PayoutStatus::Completed => true,
            PayoutStatus::Pending => false,
        };

        let payout_id = payout.id;
        let merchant_id = payout.merchant_id;
        let amount = payout.amount;

        let mut update: payout::ActiveModel = payout.into();
        update.status = Set(PayoutStatus::Failed);
        update.update(&txn).await?;
        if was_completed {
            adjust_total_payouts(&txn, merchant_id, -amount).await?;
        }

        txn.commit().await?;
        warn!(%payout_id, %merchant_id, reversed, "Payout failed");
        self.event_sender
            .send_or_log(Event::PayoutFailed {
                payout_id,
                merchant_id,
            })
            .await;

        Ok(TransferResult::Applied {
            payout_id,
            merchant_id,
        })
    }

    /// Withdrawable balance: processing splits past their hold window.
    pub async fn available_balance(
        &self,
        merchant_id: Uuid,
    ) -> Result<MerchantBalance, ServiceError> {
        let merchant = merchant::Entity::find_by_id(merchant_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Merchant {} not found", merchant_id)))?;

        let splits = order_merchant_split::Entity::find()
            .filter(order_merchant_split::Column::MerchantId.eq(merchant_id))
            .filter(order_merchant_split::Column::Status.eq(SplitStatus::Processing))
            .all(&*self.db)
            .await?;

        let now = Utc::now();
        let (available, on_hold) =
            splits
                .iter()
                .fold((Decimal::ZERO, Decimal::ZERO), |(ready, held), split| {
                    if split.hold_until < now {
                        (ready + split.amount_due, held)
                    } else {
                        (ready, held + split.amount_due)
                    }
                });

        Ok(MerchantBalance {
            merchant_id,
            available,
            on_hold,
            total_payouts: merchant.total_payouts,
        })
    }
}

async fn lock_payout(
    txn: &DatabaseTransaction,
    transfer_code: &str,
) -> Result<payout::Model, ServiceError> {
    payout::Entity::find()
        .filter(payout::Column::TransferCode.eq(transfer_code))
        .lock_exclusive()
        .one(txn)
        .await?
        .ok_or_else(|| {
            ServiceError::NotFound(format!("payout with transfer code {} not found", transfer_code))
        })
}

/// `total_payouts = total_payouts + delta`, evaluated by the database.
async fn adjust_total_payouts(
    txn: &DatabaseTransaction,
    merchant_id: Uuid,
    delta: Decimal,
) -> Result<(), ServiceError> {
    let result = merchant::Entity::update_many()
        .col_expr(
            merchant::Column::TotalPayouts,
            Expr::col(merchant::Column::TotalPayouts).add(delta),
        )
        .col_expr(merchant::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(merchant::Column::Id.eq(merchant_id))
        .exec(txn)
        .await?;

    if result.rows_affected != 1 {
        error!(%merchant_id, "Payout references a missing merchant");
        return Err(ServiceError::NotFound(format!(
            "Merchant {} not found",
            merchant_id
        )));
    }
    Ok(())
}
