use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event and only logs if the channel is gone.
    ///
    /// Used after commits: a lost notification must never fail the state change
    /// that already happened.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping event; notification channel unavailable");
        }
    }
}

// Events emitted after durable state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PaymentCompleted {
        payment_id: Uuid,
        order_id: Uuid,
        reference: String,
    },
    PaymentFailed {
        payment_id: Uuid,
        reference: String,
        reason: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    CartConverted {
        user_id: Uuid,
    },
    PayoutCompleted {
        payout_id: Uuid,
        merchant_id: Uuid,
    },
    PayoutFailed {
        payout_id: Uuid,
        merchant_id: Uuid,
    },
}

/// Drains the event channel. Customer and merchant e-mails hang off this loop;
/// it never feeds back into settlement.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentCompleted {
                payment_id,
                order_id,
                reference,
            } => {
                info!(%payment_id, %order_id, %reference, "Payment completed; notifying customer and merchants");
            }
            Event::PaymentFailed {
                payment_id,
                reference,
                reason,
            } => {
                info!(%payment_id, %reference, %reason, "Payment failed; notifying customer");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "Order status changed");
            }
            Event::CartConverted { user_id } => {
                info!(%user_id, "Cart converted");
            }
            Event::PayoutCompleted {
                payout_id,
                merchant_id,
            } => {
                info!(%payout_id, %merchant_id, "Payout completed; notifying merchant");
            }
            Event::PayoutFailed {
                payout_id,
                merchant_id,
            } => {
                info!(%payout_id, %merchant_id, "Payout failed; notifying merchant");
            }
        }
    }

    info!("Event processing loop stopped");
}
