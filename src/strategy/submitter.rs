//! Single-order submission and open-order cleanup.

use crate::gateway::{BrokerGateway, OrderRequest, OrderSide};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Order command produced by the strategies. Market unless `limit_price` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOrder {
    pub symbol: String,
    pub quantity: u64,
    pub side: OrderSide,
    pub limit_price: Option<Decimal>,
}

impl PendingOrder {
    pub fn new(symbol: impl Into<String>, quantity: u64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            side,
            limit_price: None,
        }
    }

    pub fn limit(
        symbol: impl Into<String>,
        quantity: u64,
        side: OrderSide,
        limit_price: Decimal,
    ) -> Self {
        Self {
            limit_price: Some(limit_price),
            ..Self::new(symbol, quantity, side)
        }
    }

    fn to_request(&self) -> OrderRequest {
        match self.limit_price {
            Some(price) => OrderRequest::limit(self.symbol.clone(), self.quantity, self.side, price),
            None => OrderRequest::market(self.symbol.clone(), self.quantity, self.side),
        }
    }

    /// Order from a signed share delta: positive goes on `side`, negative on
    /// the opposite side.
    pub fn from_delta(symbol: impl Into<String>, delta: i64, side: OrderSide) -> Self {
        let side = if delta >= 0 { side } else { side.opposite() };
        Self::new(symbol, delta.unsigned_abs(), side)
    }
}

/// Submits orders, reporting success instead of propagating errors.
#[derive(Clone)]
pub struct OrderSubmitter {
    gateway: Arc<dyn BrokerGateway>,
}

impl OrderSubmitter {
    pub fn new(gateway: Arc<dyn BrokerGateway>) -> Self {
        Self { gateway }
    }

    /// Submit a day order. Zero quantity is a successful no-op.
    pub async fn submit(&self, order: &PendingOrder) -> bool {
        let symbol = &order.symbol;
        if order.quantity == 0 {
            debug!(%symbol, side = %order.side, "Quantity is zero. Order not sent");
            return true;
        }

        let request = order.to_request();
        match self.gateway.create_order(&request).await {
            Ok(ack) => {
                info!(
                    %symbol,
                    quantity = order.quantity,
                    side = %order.side,
                    order_id = %ack.id,
                    limit_price = ?order.limit_price,
                    "Order submitted"
                );
                true
            }
            Err(e) => {
                error!(
                    %symbol,
                    quantity = order.quantity,
                    side = %order.side,
                    error = %e,
                    "Order failed"
                );
                false
            }
        }
    }

    /// Submit several orders concurrently; results keep input order.
    pub async fn submit_all(&self, orders: &[PendingOrder]) -> Vec<bool> {
        join_all(orders.iter().map(|order| self.submit(order))).await
    }

    /// Cancel every open order. Returns the number successfully cancelled.
    pub async fn cancel_open_orders(&self) -> usize {
        let orders = match self.gateway.get_open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                error!(error = %e, "Error while getting open orders");
                return 0;
            }
        };

        if orders.is_empty() {
            return 0;
        }
        debug!(count = orders.len(), "Canceling existing orders");

        let results = join_all(orders.iter().map(|order| async move {
            match self.gateway.cancel_order(&order.id).await {
                Ok(()) => true,
                Err(e) => {
                    error!(order_id = %order.id, symbol = %order.symbol, error = %e, "Error while cancelling order");
                    false
                }
            }
        }))
        .await;

        results.into_iter().filter(|ok| *ok).count()
    }
}
