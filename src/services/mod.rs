// Checkout and payment lookups
pub mod payments;
pub mod reconciliation;

// Paid-transition of orders
pub mod settlement;

// Merchant payouts
pub mod payouts;

// Cancellation of unpaid orders
pub mod order_cleanup;
