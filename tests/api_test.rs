mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use chrono::{Duration, Utc};
use common::{
    charge_event, seed_merchant, seed_order, seed_pending_payment, succeeded, Line, TestContext,
    TEST_SECRET,
};
use http_body_util::BodyExt;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use settlement_api::{
    entities::{
        order_merchant_split::{self, SplitStatus},
        payment::{self, PaymentStatus},
    },
    webhooks::{signature::sign, SIGNATURE_HEADER},
};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(ctx: &TestContext, request: Request<Body>) -> (StatusCode, Value) {
    let response = ctx.router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn json_request(method: Method, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn webhook_request(body: &str, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn health_endpoints_respond() {
    let ctx = TestContext::new().await;
    let (status, body) = send(
        &ctx,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");

    let (status, body) = send(
        &ctx,
        Request::builder()
            .uri("/health/ready")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn initialize_records_pending_payment_in_minor_units() {
    let ctx = TestContext::new().await;
    let order = seed_order(&ctx.db, Uuid::new_v4(), dec!(19.99)).await;
    ctx.provider.issue_reference("ref_init_1");

    let (status, body) = send(
        &ctx,
        json_request(
            Method::POST,
            "/api/v1/payments/initialize",
            &json!({"order_id": order.id, "amount": 19.99, "email": "buyer@example.com"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["data"]["reference"], "ref_init_1");
    assert_eq!(body["data"]["amount"], 1999);
    assert_eq!(body["data"]["status"], "pending");
    assert!(body["data"]["authorization_url"]
        .as_str()
        .unwrap()
        .contains("ref_init_1"));

    // a second checkout for the same order is refused
    ctx.provider.issue_reference("ref_init_2");
    let (status, _) = send(
        &ctx,
        json_request(
            Method::POST,
            "/api/v1/payments/initialize",
            &json!({"order_id": order.id, "amount": 19.99, "email": "buyer@example.com"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(ctx.provider.initialize_calls(), 1);
}

#[tokio::test]
async fn initialize_rejects_mismatched_amount_before_calling_provider() {
    let ctx = TestContext::new().await;
    let order = seed_order(&ctx.db, Uuid::new_v4(), dec!(30000.00)).await;
    ctx.provider.issue_reference("ref_never");

    let (status, body) = send(
        &ctx,
        json_request(
            Method::POST,
            "/api/v1/payments/initialize",
            &json!({"order_id": order.id, "amount": 29999.99, "email": "buyer@example.com"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("Amount mismatch"));
    assert_eq!(ctx.provider.initialize_calls(), 0);
}

#[tokio::test]
async fn verify_endpoint_settles_and_lookups_see_it() {
    let ctx = TestContext::new().await;
    let seeded = seed_pending_payment(&ctx.db, "R1", 3_000_000, &[Line::product(5, 1, 1)]).await;
    ctx.provider
        .script("R1", succeeded("R1", 3_000_000, json!("")));

    let (status, body) = send(
        &ctx,
        Request::builder()
            .uri("/api/v1/payments/verify/R1")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["status"], "completed");
    assert!(body["data"].get("provider_metadata").is_none());

    let (status, body) = send(
        &ctx,
        Request::builder()
            .uri(format!("/api/v1/orders/{}/payment", seeded.order.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reference"], "R1");

    let (status, body) = send(
        &ctx,
        Request::builder()
            .uri(format!("/api/v1/users/{}/payments", seeded.user_id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn verify_endpoint_reports_provider_failure() {
    let ctx = TestContext::new().await;
    seed_pending_payment(&ctx.db, "R9", 10_000, &[Line::product(5, 1, 1)]).await;
    ctx.provider.script(
        "R9",
        settlement_api::provider::VerificationOutcome::ProviderFailed {
            reason: "Declined".into(),
        },
    );

    let (status, body) = send(
        &ctx,
        Request::builder()
            .uri("/api/v1/payments/verify/R9")
            .header("x-request-id", "req-verify-9")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["request_id"], "req-verify-9");
}

#[tokio::test]
async fn webhook_requires_valid_signature() {
    let ctx = TestContext::new().await;
    let seeded = seed_pending_payment(&ctx.db, "R1", 3_000_000, &[Line::product(5, 1, 1)]).await;
    ctx.provider
        .script("R1", succeeded("R1", 3_000_000, json!(null)));
    let body = charge_event("R1", "success").to_string();

    let (status, _) = send(&ctx, webhook_request(&body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&ctx, webhook_request(&body, Some(&sign("wrong", body.as_bytes())))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(ctx.provider.verify_calls(), 0);

    let signature = sign(TEST_SECRET, body.as_bytes());
    let (status, reply) = send(&ctx, webhook_request(&body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply, json!({"status": "success"}));

    let payment = payment::Entity::find_by_id(seeded.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Completed);
}

#[tokio::test]
async fn webhook_rejects_invalid_json_and_acks_unknown_events() {
    let ctx = TestContext::new().await;

    let garbage = "{not json";
    let (status, _) = send(
        &ctx,
        webhook_request(garbage, Some(&sign(TEST_SECRET, garbage.as_bytes()))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = json!({"event": "customeridentification.success", "data": {}}).to_string();
    let (status, _) = send(
        &ctx,
        webhook_request(&unknown, Some(&sign(TEST_SECRET, unknown.as_bytes()))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn merchant_balance_counts_only_released_processing_splits() {
    let ctx = TestContext::new().await;
    let merchant = seed_merchant(&ctx.db, "Yaba Goods").await;
    let order = seed_order(&ctx.db, Uuid::new_v4(), dec!(500)).await;

    let now = Utc::now();
    for (amount, status, hold_until) in [
        (dec!(100.00), SplitStatus::Processing, now - Duration::hours(1)),
        (dec!(40.50), SplitStatus::Processing, now + Duration::hours(24)),
        (dec!(75.00), SplitStatus::Pending, now - Duration::hours(1)),
        (dec!(60.00), SplitStatus::Paid, now - Duration::hours(1)),
    ] {
        order_merchant_split::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            merchant_id: Set(merchant.id),
            amount_due: Set(amount),
            fee: Set(dec!(0)),
            status: Set(status),
            hold_until: Set(hold_until),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*ctx.db)
        .await
        .unwrap();
    }

    let (status, body) = send(
        &ctx,
        Request::builder()
            .uri(format!("/api/v1/merchants/{}/balance", merchant.id))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let available: rust_decimal::Decimal =
        serde_json::from_value(body["data"]["available"].clone()).unwrap();
    let on_hold: rust_decimal::Decimal =
        serde_json::from_value(body["data"]["on_hold"].clone()).unwrap();
    assert_eq!(available, dec!(100));
    assert_eq!(on_hold, dec!(40.5));

    let (status, _) = send(
        &ctx,
        Request::builder()
            .uri(format!("/api/v1/merchants/{}/balance", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_routes_get_json_404() {
    let ctx = TestContext::new().await;
    let (status, body) = send(
        &ctx,
        Request::builder().uri("/api/v2/nothing").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}
