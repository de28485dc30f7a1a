#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::{json, Value};
use settlement_api::{
    config::AppConfig,
    db,
    entities::{
        cart::{self, CartStatus},
        cart_item, inventory, merchant,
        order::{self, OrderStatus},
        order_item,
        order_merchant_split::{self, SplitStatus},
        payment::{self, PaymentStatus},
        payout::{self, PayoutStatus},
    },
    events::{Event, EventSender},
    handlers::AppServices,
    provider::{
        InitializeTransaction, InitializedTransaction, PaymentProvider, ProviderError,
        VerificationOutcome, VerifiedTransaction,
    },
    services::{order_cleanup::OrderCleanupService, settlement::SettlementService},
    AppState,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, Barrier};
use uuid::Uuid;

pub const TEST_SECRET: &str = "sk_test_settlement_secret";

/// Scripted provider: answers `verify` from a per-reference table and counts calls.
#[derive(Default)]
pub struct StubProvider {
    outcomes: Mutex<HashMap<String, VerificationOutcome>>,
    next_reference: Mutex<Option<String>>,
    verify_calls: AtomicUsize,
    initialize_calls: AtomicUsize,
    gate: Mutex<Option<Arc<Barrier>>>,
}

impl StubProvider {
    pub fn script(&self, reference: &str, outcome: VerificationOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(reference.to_string(), outcome);
    }

    pub fn issue_reference(&self, reference: &str) {
        *self.next_reference.lock().unwrap() = Some(reference.to_string());
    }

    /// Holds every `verify` until `callers` of them are in flight at once.
    pub fn gate_verifications(&self, callers: usize) {
        *self.gate.lock().unwrap() = Some(Arc::new(Barrier::new(callers)));
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for StubProvider {
    async fn initialize(
        &self,
        request: InitializeTransaction,
    ) -> Result<InitializedTransaction, ProviderError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        let reference = self
            .next_reference
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| ProviderError::Rejected("no reference scripted".into()))?;
        Ok(InitializedTransaction {
            authorization_url: format!("https://checkout.example.com/{}?amount={}", reference, request.amount),
            reference,
            access_code: "ac_test".into(),
        })
    }

    async fn verify(&self, reference: &str) -> VerificationOutcome {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .unwrap_or_else(|| {
                VerificationOutcome::TransportError(ProviderError::UnexpectedStatus {
                    status: 404,
                    body: "unscripted reference".into(),
                })
            })
    }
}

pub fn succeeded(reference: &str, amount: i64, metadata: Value) -> VerificationOutcome {
    VerificationOutcome::Succeeded(VerifiedTransaction {
        reference: reference.to_string(),
        status: "success".to_string(),
        amount,
        currency: Some("NGN".to_string()),
        metadata,
    })
}

/// File-backed SQLite database with migrations applied, plus the wiring around it.
pub struct TestContext {
    pub db: Arc<DatabaseConnection>,
    pub provider: Arc<StubProvider>,
    pub event_sender: Arc<EventSender>,
    pub events: mpsc::Receiver<Event>,
    pub config: AppConfig,
    _dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settlement.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", path.display()),
            TEST_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // One connection serializes transactions the way row locks would.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let (tx, rx) = mpsc::channel(256);

        Self {
            db: Arc::new(pool),
            provider: Arc::new(StubProvider::default()),
            event_sender: Arc::new(EventSender::new(tx)),
            events: rx,
            config: cfg,
            _dir: dir,
        }
    }

    pub fn settlement(&self) -> SettlementService {
        SettlementService::new(
            self.db.clone(),
            self.provider.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn cleanup(&self) -> OrderCleanupService {
        OrderCleanupService::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.config.abandoned_order_ttl(),
        )
    }

    pub fn services(&self) -> AppServices {
        AppServices::new(
            self.db.clone(),
            self.provider.clone(),
            self.event_sender.clone(),
            &self.config,
        )
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            db: self.db.clone(),
            config: self.config.clone(),
            event_sender: self.event_sender.clone(),
            services: self.services(),
        };
        settlement_api::app_router().with_state(state)
    }

    /// Events emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// One ordered line and the stock behind it.
#[derive(Debug, Clone, Copy)]
pub struct Line {
    pub stock: i32,
    pub reserved: i32,
    pub ordered: i32,
    pub by_variant: bool,
}

impl Line {
    pub fn product(stock: i32, reserved: i32, ordered: i32) -> Self {
        Self {
            stock,
            reserved,
            ordered,
            by_variant: false,
        }
    }

    pub fn variant(stock: i32, reserved: i32, ordered: i32) -> Self {
        Self {
            by_variant: true,
            ..Self::product(stock, reserved, ordered)
        }
    }
}

pub struct Seeded {
    pub user_id: Uuid,
    pub merchant: merchant::Model,
    pub order: order::Model,
    pub payment: payment::Model,
    pub inventory: Vec<inventory::Model>,
    pub active_cart: cart::Model,
    pub old_cart: cart::Model,
}

pub async fn seed_merchant(db: &DatabaseConnection, name: &str) -> merchant::Model {
    let now = Utc::now();
    merchant::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        total_payouts: Set(Decimal::ZERO),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert merchant")
}

pub async fn seed_order(
    db: &DatabaseConnection,
    user_id: Uuid,
    sub_total: Decimal,
) -> order::Model {
    let now = Utc::now();
    order::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        sub_total: Set(sub_total),
        currency: Set("NGN".to_string()),
        status: Set(OrderStatus::Pending),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert order")
}

pub async fn seed_cart(db: &DatabaseConnection, user_id: Uuid, status: CartStatus) -> cart::Model {
    let now = Utc::now();
    let cart = cart::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        status: Set(status),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert cart");

    cart_item::ActiveModel {
        id: Set(Uuid::new_v4()),
        cart_id: Set(cart.id),
        product_id: Set(Uuid::new_v4()),
        variant_id: Set(None),
        quantity: Set(1),
        created_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert cart item");

    cart
}

/// Pending order with a pending payment under `reference`, stock for every
/// line, one pending split, an active cart and an older converted cart.
pub async fn seed_pending_payment(
    db: &DatabaseConnection,
    reference: &str,
    amount_minor: i64,
    lines: &[Line],
) -> Seeded {
    let user_id = Uuid::new_v4();
    let merchant = seed_merchant(db, "Acme Textiles").await;
    let sub_total = Decimal::new(amount_minor, 2);
    let order = seed_order(db, user_id, sub_total).await;

    let mut stock = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        let now = Utc::now();
        let product_id = Uuid::new_v4();
        let variant_id = line.by_variant.then(Uuid::new_v4);

        let row = inventory::ActiveModel {
            id: Set(Uuid::new_v4()),
            merchant_id: Set(merchant.id),
            product_id: Set(Some(product_id)),
            variant_id: Set(variant_id),
            quantity: Set(line.stock),
            reserved_quantity: Set(line.reserved),
            low_stock_threshold: Set(2),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .expect("insert inventory");

        order_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            merchant_id: Set(merchant.id),
            product_id: Set(product_id),
            variant_id: Set(variant_id),
            quantity: Set(line.ordered),
            price: Set(Decimal::new(1000, 2)),
            created_at: Set(now + Duration::milliseconds(idx as i64)),
        }
        .insert(db)
        .await
        .expect("insert order item");

        stock.push(row);
    }

    let now = Utc::now();
    order_merchant_split::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        merchant_id: Set(merchant.id),
        amount_due: Set(sub_total * Decimal::new(95, 2)),
        fee: Set(sub_total * Decimal::new(5, 2)),
        status: Set(SplitStatus::Pending),
        hold_until: Set(now + Duration::hours(72)),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert split");

    let old_cart = seed_cart(db, user_id, CartStatus::Converted).await;
    let active_cart = seed_cart(db, user_id, CartStatus::Active).await;

    let payment = payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        amount: Set(amount_minor),
        currency: Set("NGN".to_string()),
        status: Set(PaymentStatus::Pending),
        transaction_ref: Set(reference.to_string()),
        provider_metadata: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert payment");

    Seeded {
        user_id,
        merchant,
        order,
        payment,
        inventory: stock,
        active_cart,
        old_cart,
    }
}

/// Moves the order's creation time `age` into the past.
pub async fn backdate_order(db: &DatabaseConnection, order: &order::Model, age: Duration) {
    let mut stale: order::ActiveModel = order.clone().into();
    stale.created_at = Set(Utc::now() - age);
    stale.update(db).await.expect("backdate order");
}

pub async fn seed_payout(
    db: &DatabaseConnection,
    merchant_id: Uuid,
    amount: Decimal,
    transfer_code: &str,
    status: PayoutStatus,
) -> payout::Model {
    let now = Utc::now();
    payout::ActiveModel {
        id: Set(Uuid::new_v4()),
        merchant_id: Set(merchant_id),
        amount: Set(amount),
        status: Set(status),
        transfer_code: Set(Some(transfer_code.to_string())),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("insert payout")
}

pub fn charge_event(reference: &str, status: &str) -> Value {
    json!({
        "event": "charge.success",
        "data": {
            "reference": reference,
            "status": status,
            "amount": 3_000_000,
            "metadata": ""
        }
    })
}

pub fn transfer_event(event: &str, transfer_code: &str) -> Value {
    json!({
        "event": event,
        "data": {
            "transfer_code": transfer_code,
            "amount": 1_500_000,
            "status": event.trim_start_matches("transfer.")
        }
    })
}
