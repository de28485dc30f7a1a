use crate::{errors::ServiceError, services::payouts::MerchantBalance, ApiResponse, AppState};
use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use uuid::Uuid;

/// Withdrawable and held proceeds for a merchant
async fn get_merchant_balance(
    State(state): State<AppState>,
    Path(merchant_id): Path<Uuid>,
) -> Result<Json<ApiResponse<MerchantBalance>>, ServiceError> {
    let balance = state.services.payouts.available_balance(merchant_id).await?;
    Ok(Json(ApiResponse::success(balance)))
}

pub fn payouts_routes() -> Router<AppState> {
    Router::new().route("/merchants/:id/balance", get(get_merchant_balance))
}
