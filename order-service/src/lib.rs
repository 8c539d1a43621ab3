//! order-service: checkout and fulfillment for the storefront.
//!
//! Turns carts into priced orders, walks them through fulfillment, confirms
//! payments from the bank webhook and keeps the loyalty ledger.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
