pub mod health;
pub mod payment_webhooks;
pub mod payments;
pub mod payouts;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    provider::PaymentProvider,
    services::{
        payments::PaymentService, payouts::PayoutService, settlement::SettlementService,
    },
    webhooks::WebhookDispatcher,
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub payments: Arc<PaymentService>,
    pub settlement: Arc<SettlementService>,
    pub payouts: Arc<PayoutService>,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        provider: Arc<dyn PaymentProvider>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
    ) -> Self {
        let payments = Arc::new(PaymentService::new(
            db_pool.clone(),
            provider.clone(),
            config.default_currency.clone(),
            config.callback_url.clone(),
        ));
        let settlement = Arc::new(SettlementService::new(
            db_pool.clone(),
            provider,
            event_sender.clone(),
        ));
        let payouts = Arc::new(PayoutService::new(db_pool, event_sender));
        let webhooks = Arc::new(WebhookDispatcher::new(settlement.clone(), payouts.clone()));

        Self {
            payments,
            settlement,
            payouts,
            webhooks,
        }
    }
}
