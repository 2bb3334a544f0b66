//! In-memory paper broker for simulation and testing.

use super::error::{GatewayError, GatewayResult};
use super::traits::BrokerGateway;
use super::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Simulated broker state.
#[derive(Debug, Clone)]
pub struct PaperState {
    pub clock: Clock,
    pub equity: Decimal,
    /// Signed share count per symbol (negative = short)
    pub holdings: HashMap<String, i64>,
    pub bars: HashMap<String, Vec<Bar>>,
    /// Orders accepted but not filled, by id
    pub open_orders: HashMap<String, Order>,
    /// Every accepted order in submission order
    pub order_log: Vec<OrderRequest>,
    /// Ids cancelled through the gateway
    pub cancelled: Vec<String>,
    /// Symbols whose orders are rejected
    pub reject_symbols: HashSet<String>,
    /// Symbols whose bar requests fail
    pub failing_bars: HashSet<String>,
    pub clock_fails: bool,
    pub account_fails: bool,
    pub positions_fail: bool,
}

impl Default for PaperState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            clock: Clock {
                timestamp: now,
                is_open: true,
                next_open: now + Duration::days(1),
                next_close: now + Duration::hours(6),
            },
            equity: dec!(100000),
            holdings: HashMap::new(),
            bars: HashMap::new(),
            open_orders: HashMap::new(),
            order_log: Vec::new(),
            cancelled: Vec::new(),
            reject_symbols: HashSet::new(),
            failing_bars: HashSet::new(),
            clock_fails: false,
            account_fails: false,
            positions_fail: false,
        }
    }
}

/// Paper gateway that fills every order immediately at the latest close.
#[derive(Clone, Default)]
pub struct PaperGateway {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: Arc<AtomicU64>,
}

impl PaperGateway {
    /// Create a paper gateway with the given starting equity.
    pub fn new(equity: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState {
                equity,
                ..Default::default()
            })),
            order_id_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mutate the simulated state directly.
    pub async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PaperState),
    {
        let mut state = self.state.write().await;
        f(&mut state);
    }

    /// Snapshot of the simulated state.
    pub async fn snapshot(&self) -> PaperState {
        self.state.read().await.clone()
    }

    /// Set a flat price history for a symbol: `bars` one-minute bars moving
    /// linearly from `open` to `close`.
    pub async fn set_trend(&self, symbol: &str, open: Decimal, close: Decimal, bars: usize) {
        let bars = bars.max(1);
        let start = Utc::now() - Duration::minutes(bars as i64);
        let step = if bars > 1 {
            (close - open) / Decimal::from(bars as u64 - 1)
        } else {
            Decimal::ZERO
        };

        let series = (0..bars)
            .map(|i| {
                let price = if i + 1 == bars {
                    close
                } else {
                    open + step * Decimal::from(i as u64)
                };
                Bar {
                    timestamp: start + Duration::minutes(i as i64),
                    open: if i == 0 { open } else { price },
                    close: price,
                }
            })
            .collect();

        self.state
            .write()
            .await
            .bars
            .insert(symbol.to_string(), series);
    }

    /// Set a signed holding (negative = short).
    pub async fn set_holding(&self, symbol: &str, shares: i64) {
        let mut state = self.state.write().await;
        if shares == 0 {
            state.holdings.remove(symbol);
        } else {
            state.holdings.insert(symbol.to_string(), shares);
        }
    }

    /// Signed holding for a symbol.
    pub async fn holding(&self, symbol: &str) -> i64 {
        self.state
            .read()
            .await
            .holdings
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    /// Park an order as open without filling it.
    pub async fn add_open_order(&self, symbol: &str, side: OrderSide, qty: u64) -> String {
        let id = self.next_order_id();
        let order = Order {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            status: "new".to_string(),
            qty: Some(Decimal::from(qty)),
        };
        self.state.write().await.open_orders.insert(id.clone(), order);
        id
    }

    fn next_order_id(&self) -> String {
        format!(
            "paper-{}",
            self.order_id_counter.fetch_add(1, Ordering::SeqCst) + 1
        )
    }

    fn last_close(state: &PaperState, symbol: &str) -> Decimal {
        state
            .bars
            .get(symbol)
            .and_then(|bars| bars.last())
            .map(|bar| bar.close)
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    async fn get_clock(&self) -> GatewayResult<Clock> {
        let state = self.state.read().await;
        if state.clock_fails {
            return Err(GatewayError::Unavailable("clock".to_string()));
        }
        Ok(state.clock.clone())
    }

    async fn get_bars(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        limit: u32,
    ) -> GatewayResult<Vec<Bar>> {
        let state = self.state.read().await;
        if state.failing_bars.contains(symbol) {
            return Err(GatewayError::Unavailable(format!("bars for {symbol}")));
        }
        let bars = state.bars.get(symbol).cloned().unwrap_or_default();
        let skip = bars.len().saturating_sub(limit as usize);
        Ok(bars.into_iter().skip(skip).collect())
    }

    async fn get_account(&self) -> GatewayResult<Account> {
        let state = self.state.read().await;
        if state.account_fails {
            return Err(GatewayError::Unavailable("account".to_string()));
        }
        Ok(Account {
            equity: state.equity,
            buying_power: state.equity * dec!(2),
            portfolio_value: state.equity,
        })
    }

    async fn get_positions(&self) -> GatewayResult<Vec<Position>> {
        let state = self.state.read().await;
        if state.positions_fail {
            return Err(GatewayError::Unavailable("positions".to_string()));
        }
        let mut positions: Vec<Position> = state
            .holdings
            .iter()
            .filter(|(_, shares)| **shares != 0)
            .map(|(symbol, shares)| {
                let price = Self::last_close(&state, symbol);
                Position {
                    symbol: symbol.clone(),
                    side: if *shares > 0 {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    quantity: shares.unsigned_abs(),
                    market_value: Decimal::from(*shares) * price,
                }
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_open_orders(&self) -> GatewayResult<Vec<Order>> {
        Ok(self.state.read().await.open_orders.values().cloned().collect())
    }

    async fn cancel_order(&self, order_id: &str) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        if state.open_orders.remove(order_id).is_none() {
            return Err(GatewayError::Api {
                status: 404,
                message: format!("order {order_id} not found"),
            });
        }
        state.cancelled.push(order_id.to_string());
        debug!(%order_id, "Paper order cancelled");
        Ok(())
    }

    async fn create_order(&self, order: &OrderRequest) -> GatewayResult<Order> {
        let mut state = self.state.write().await;
        if state.reject_symbols.contains(&order.symbol) {
            return Err(GatewayError::Api {
                status: 403,
                message: format!("order for {} rejected", order.symbol),
            });
        }

        let signed = order.quantity as i64
            * match order.side {
                OrderSide::Buy => 1,
                OrderSide::Sell => -1,
            };
        let holding = state.holdings.entry(order.symbol.clone()).or_insert(0);
        *holding += signed;
        if *holding == 0 {
            state.holdings.remove(&order.symbol);
        }
        state.order_log.push(order.clone());

        let id = self.next_order_id();
        info!(
            order_id = %id,
            symbol = %order.symbol,
            side = ?order.side,
            quantity = order.quantity,
            price = %Self::last_close(&state, &order.symbol),
            "Paper order filled"
        );

        Ok(Order {
            id,
            symbol: order.symbol.clone(),
            side: order.side,
            status: "filled".to_string(),
            qty: Some(Decimal::from(order.quantity)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_orders_update_signed_holdings() {
        let gateway = PaperGateway::new(dec!(50000));
        gateway.set_trend("AAPL", dec!(100), dec!(110), 5).await;

        gateway
            .create_order(&OrderRequest::market("AAPL", 10, OrderSide::Buy))
            .await
            .unwrap();
        gateway
            .create_order(&OrderRequest::market("AAPL", 25, OrderSide::Sell))
            .await
            .unwrap();

        assert_eq!(gateway.holding("AAPL").await, -15);
        let positions = gateway.get_positions().await.unwrap();
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].quantity, 15);
        assert_eq!(positions[0].market_value, dec!(-1650));
    }

    #[tokio::test]
    async fn test_trend_bars_and_limit() {
        let gateway = PaperGateway::default();
        gateway.set_trend("MSFT", dec!(100), dec!(104), 5).await;

        let bars = gateway
            .get_bars("MSFT", Timeframe::Minute, 3)
            .await
            .unwrap();
        assert_eq!(bars.len(), 3);
        assert_eq!(bars.last().unwrap().close, dec!(104));

        let all = gateway
            .get_bars("MSFT", Timeframe::Minute, 10)
            .await
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].open, dec!(100));
    }

    #[tokio::test]
    async fn test_rejected_symbol_leaves_holdings_untouched() {
        let gateway = PaperGateway::default();
        gateway
            .update(|s| {
                s.reject_symbols.insert("GME".to_string());
            })
            .await;

        let result = gateway
            .create_order(&OrderRequest::market("GME", 1, OrderSide::Buy))
            .await;

        assert!(matches!(result, Err(GatewayError::Api { status: 403, .. })));
        assert_eq!(gateway.holding("GME").await, 0);
        assert!(gateway.snapshot().await.order_log.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_fails() {
        let gateway = PaperGateway::default();
        let id = gateway.add_open_order("AAPL", OrderSide::Buy, 5).await;

        assert!(gateway.cancel_order(&id).await.is_ok());
        assert!(gateway.cancel_order(&id).await.is_err());
        assert_eq!(gateway.snapshot().await.cancelled, vec![id]);
    }
}
