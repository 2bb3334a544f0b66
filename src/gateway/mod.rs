//! Brokerage gateway for the long-short strategy.
//!
//! ## Alpaca
//! REST client for the trading API (clock, account, positions, orders) and
//! the market data API (minute bars). Paper or live endpoint per config.
//!
//! ## Paper
//! In-memory broker with immediate fills, used for simulation and tests.

mod client;
mod error;
pub mod paper;
mod traits;
mod types;

pub use client::AlpacaClient;
pub use error::{GatewayError, GatewayResult};
pub use paper::{PaperGateway, PaperState};
#[cfg(test)]
pub use traits::MockBrokerGateway;
pub use traits::BrokerGateway;
pub use types::*;
