//! # Long-Short Equity
//!
//! A momentum-ranked 130/30 long-short equity rebalancer for the Alpaca
//! brokerage API.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading, validation and universe resolution
//! - `gateway`: Broker capability trait, Alpaca REST client and paper broker
//! - `strategy`: Ranking, bucketing, reconciliation, batch ordering and the loop
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod gateway;
pub mod strategy;
pub mod utils;

pub use config::Config;
