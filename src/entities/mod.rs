pub mod cart;
pub mod cart_item;
pub mod discount;
pub mod discount_redemption;
pub mod order;
pub mod order_item;
pub mod order_item_allocation;
pub mod order_status_log;
pub mod product;
pub mod stock;
pub mod stock_history;
pub mod store;
