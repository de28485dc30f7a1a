use crate::errors::ServiceError;
use crate::handlers::AppState;
use crate::services::payments::{InitializePaymentRequest, PaymentResponse};
use crate::ApiResponse;
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

// Handler functions

/// Opens a provider transaction for an order and records the pending payment
async fn initialize_payment(
    State(state): State<AppState>,
    Json(request): Json<InitializePaymentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentResponse>>), ServiceError> {
    let payment = state.services.payments.initialize_checkout(request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(payment))))
}

/// Re-verifies a payment with the provider and settles the order
async fn verify_payment(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<ApiResponse<PaymentResponse>>, ServiceError> {
    let payment = state.services.settlement.settle(&reference).await?;
    Ok(Json(ApiResponse::success(payment.into())))
}

async fn get_order_payment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentResponse>>, ServiceError> {
    let payment = state.services.payments.payment_for_order(order_id).await?;
    Ok(Json(ApiResponse::success(payment.into())))
}

async fn list_user_payments(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<PaymentResponse>>>, ServiceError> {
    let payments = state.services.payments.payments_for_user(user_id).await?;
    Ok(Json(ApiResponse::success(
        payments.into_iter().map(PaymentResponse::from).collect(),
    )))
}

/// Creates the router for payment endpoints
pub fn payments_routes() -> Router<AppState> {
    Router::new()
        .route("/payments/initialize", post(initialize_payment))
        .route("/payments/verify/:reference", get(verify_payment))
        .route("/orders/:id/payment", get(get_order_payment))
        .route("/users/:id/payments", get(list_user_payments))
}
