pub mod cart;
pub mod cart_item;
pub mod inventory;
pub mod merchant;
pub mod order;
pub mod order_item;
pub mod order_merchant_split;
pub mod payment;
pub mod payout;
