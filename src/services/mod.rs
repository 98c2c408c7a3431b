// Inventory
pub mod stock_ledger;

// Pricing
pub mod discounts;

// Orders
pub mod order_status;
pub mod orders;

// Service factory for dependency injection
pub mod factory;
