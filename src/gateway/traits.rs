//! Broker-agnostic capability interface.
//!
//! The rebalance engine only ever talks to the brokerage through this trait,
//! so a live REST client and the in-memory paper gateway are interchangeable.

use super::error::GatewayResult;
use super::types::{Account, Bar, Clock, Order, OrderRequest, Position, Timeframe};
use async_trait::async_trait;

/// Market data and order routing capabilities required by the strategy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Current session clock.
    async fn get_clock(&self) -> GatewayResult<Clock>;

    /// Most recent `limit` bars, oldest first. May return fewer than requested.
    async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> GatewayResult<Vec<Bar>>;

    /// Account balances.
    async fn get_account(&self) -> GatewayResult<Account>;

    /// All currently held positions.
    async fn get_positions(&self) -> GatewayResult<Vec<Position>>;

    /// Orders that are still working.
    async fn get_open_orders(&self) -> GatewayResult<Vec<Order>>;

    /// Cancel a working order.
    async fn cancel_order(&self, order_id: &str) -> GatewayResult<()>;

    /// Submit a new order.
    async fn create_order(&self, order: &OrderRequest) -> GatewayResult<Order>;
}
