mod common;

use assert_matches::assert_matches;
use common::{
    charge_event, seed_merchant, seed_payout, seed_pending_payment, succeeded, transfer_event,
    Line, TestContext,
};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::json;
use settlement_api::{
    entities::{
        merchant,
        payment::{self, PaymentStatus},
        payout::{self, PayoutStatus},
    },
    errors::ServiceError,
    events::Event,
    webhooks::WebhookOutcome,
};

async fn payout_status(ctx: &TestContext, id: uuid::Uuid) -> PayoutStatus {
    payout::Entity::find_by_id(id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap()
        .status
}

async fn total_payouts(ctx: &TestContext, id: uuid::Uuid) -> rust_decimal::Decimal {
    merchant::Entity::find_by_id(id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap()
        .total_payouts
}

#[tokio::test]
async fn charge_success_settles_through_provider_verification() {
    let ctx = TestContext::new().await;
    let seeded = seed_pending_payment(&ctx.db, "R1", 3_000_000, &[Line::product(10, 1, 1)]).await;
    ctx.provider
        .script("R1", succeeded("R1", 3_000_000, json!({"channel": "card"})));

    let outcome = ctx
        .services()
        .webhooks
        .dispatch(&charge_event("R1", "success"))
        .await
        .unwrap();

    assert_matches!(outcome, WebhookOutcome::Settled(p) if p.id == seeded.payment.id && p.status == PaymentStatus::Completed);
    assert_eq!(ctx.provider.verify_calls(), 1);

    // provider retry of the same delivery
    let again = ctx
        .services()
        .webhooks
        .dispatch(&charge_event("R1", "success"))
        .await
        .unwrap();
    assert_matches!(again, WebhookOutcome::Settled(_));
    assert_eq!(ctx.provider.verify_calls(), 1);
}

#[tokio::test]
async fn abandoned_charge_is_rejected_before_settlement() {
    let ctx = TestContext::new().await;
    let seeded = seed_pending_payment(&ctx.db, "R1", 3_000_000, &[Line::product(10, 1, 1)]).await;

    let err = ctx
        .services()
        .webhooks
        .dispatch(&charge_event("R1", "abandoned"))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::VerificationFailed(_));
    assert_eq!(ctx.provider.verify_calls(), 0);
    let payment = payment::Entity::find_by_id(seeded.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn malformed_envelopes_are_rejected() {
    let ctx = TestContext::new().await;
    let dispatcher = ctx.services().webhooks;

    for envelope in [
        json!({"data": {}}),
        json!({"event": 7, "data": {}}),
        json!({"event": "charge.success", "data": "R1"}),
        json!({"event": "charge.success", "data": {"reference": "R1"}}),
        json!({"event": "charge.success", "data": {"reference": "R1", "status": "refunded"}}),
        json!({"event": "charge.success", "data": {"status": "success"}}),
        json!({"event": "transfer.success", "data": {"transfer_code": ""}}),
    ] {
        let err = dispatcher.dispatch(&envelope).await.unwrap_err();
        assert_matches!(err, ServiceError::MalformedWebhook(_), "envelope {}", envelope);
    }
    assert_eq!(ctx.provider.verify_calls(), 0);
}

#[tokio::test]
async fn unknown_events_are_acknowledged() {
    let ctx = TestContext::new().await;
    let outcome = ctx
        .services()
        .webhooks
        .dispatch(&json!({"event": "subscription.create", "data": {}}))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored("subscription.create".into()));
}

#[tokio::test]
async fn transfer_success_increments_total_once() {
    let mut ctx = TestContext::new().await;
    let merchant = seed_merchant(&ctx.db, "Kano Leather").await;
    let payout = seed_payout(&ctx.db, merchant.id, dec!(15000.00), "TRF_1", PayoutStatus::Pending).await;
    let dispatcher = ctx.services().webhooks;

    let outcome = dispatcher
        .dispatch(&transfer_event("transfer.success", "TRF_1"))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::PayoutCompleted(payout.id));

    dispatcher
        .dispatch(&transfer_event("transfer.success", "TRF_1"))
        .await
        .unwrap();

    assert_eq!(payout_status(&ctx, payout.id).await, PayoutStatus::Completed);
    assert_eq!(total_payouts(&ctx, merchant.id).await, dec!(15000));
    assert_eq!(
        ctx.drain_events(),
        vec![Event::PayoutCompleted {
            payout_id: payout.id,
            merchant_id: merchant.id
        }]
    );
}

#[tokio::test]
async fn concurrent_transfer_successes_for_different_payouts_both_count() {
    let ctx = TestContext::new().await;
    let merchant = seed_merchant(&ctx.db, "Aba Shoes").await;
    seed_payout(&ctx.db, merchant.id, dec!(100.50), "TRF_A", PayoutStatus::Pending).await;
    seed_payout(&ctx.db, merchant.id, dec!(200.25), "TRF_B", PayoutStatus::Pending).await;
    let dispatcher = ctx.services().webhooks;

    let first = transfer_event("transfer.success", "TRF_A");
    let second = transfer_event("transfer.success", "TRF_B");
    let (a, b) = tokio::join!(dispatcher.dispatch(&first), dispatcher.dispatch(&second));
    a.unwrap();
    b.unwrap();

    assert_eq!(total_payouts(&ctx, merchant.id).await, dec!(300.75));
}

#[tokio::test]
async fn failed_transfer_marks_payout_failed() {
    let ctx = TestContext::new().await;
    let merchant = seed_merchant(&ctx.db, "Ikeja Prints").await;
    let payout = seed_payout(&ctx.db, merchant.id, dec!(500), "TRF_F", PayoutStatus::Pending).await;

    let outcome = ctx
        .services()
        .webhooks
        .dispatch(&transfer_event("transfer.failed", "TRF_F"))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::PayoutFailed(payout.id));
    assert_eq!(payout_status(&ctx, payout.id).await, PayoutStatus::Failed);
    assert_eq!(total_payouts(&ctx, merchant.id).await, dec!(0));
}

#[tokio::test]
async fn reversal_of_completed_payout_takes_amount_back() {
    let ctx = TestContext::new().await;
    let merchant = seed_merchant(&ctx.db, "Lekki Crafts").await;
    let payout = seed_payout(&ctx.db, merchant.id, dec!(750), "TRF_R", PayoutStatus::Pending).await;
    let dispatcher = ctx.services().webhooks;

    dispatcher
        .dispatch(&transfer_event("transfer.success", "TRF_R"))
        .await
        .unwrap();
    assert_eq!(total_payouts(&ctx, merchant.id).await, dec!(750));

    // a plain failure cannot undo a completed payout
    let err = dispatcher
        .dispatch(&transfer_event("transfer.failed", "TRF_R"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidStatus(_));

    dispatcher
        .dispatch(&transfer_event("transfer.reversed", "TRF_R"))
        .await
        .unwrap();
    assert_eq!(payout_status(&ctx, payout.id).await, PayoutStatus::Failed);
    assert_eq!(total_payouts(&ctx, merchant.id).await, dec!(0));
}

#[tokio::test]
async fn unknown_transfer_code_is_not_found() {
    let ctx = TestContext::new().await;
    let err = ctx
        .services()
        .webhooks
        .dispatch(&transfer_event("transfer.success", "TRF_NOPE"))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
