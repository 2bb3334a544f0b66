//! Type definitions for brokerage requests and responses.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market session clock.
#[derive(Debug, Clone, Deserialize)]
pub struct Clock {
    pub timestamp: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

/// A single OHLC price bar.
#[derive(Debug, Clone, Deserialize)]
pub struct Bar {
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    pub open: Decimal,
    #[serde(rename = "c")]
    pub close: Decimal,
}

/// Bars endpoint envelope. `bars` is null when the symbol has no data.
#[derive(Debug, Clone, Deserialize)]
pub struct BarsResponse {
    #[serde(default)]
    pub bars: Option<Vec<Bar>>,
}

/// Bar aggregation period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Minute,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Minute => "1Min",
        }
    }
}

/// Account balances.
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(with = "rust_decimal::serde::str")]
    pub equity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub buying_power: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub portfolio_value: Decimal,
}

/// Direction of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that closes a position of this direction.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

/// Raw position as reported by the broker (signed, possibly fractional qty).
#[derive(Debug, Clone, Deserialize)]
pub struct RawPosition {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    pub side: PositionSide,
    #[serde(with = "rust_decimal::serde::str")]
    pub market_value: Decimal,
}

/// Held position snapshot with a whole-share absolute quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: u64,
    pub market_value: Decimal,
}

impl From<RawPosition> for Position {
    fn from(raw: RawPosition) -> Self {
        // Fractional shares are floored
        let quantity = raw.qty.abs().floor().to_u64().unwrap_or(0);
        Self {
            symbol: raw.symbol,
            side: raw.side,
            quantity,
            market_value: raw.market_value,
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
}

/// New order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: String,
    #[serde(rename = "qty")]
    pub quantity: u64,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::str_option"
    )]
    pub limit_price: Option<Decimal>,
}

impl OrderRequest {
    /// Market order valid for the trading day.
    pub fn market(symbol: impl Into<String>, quantity: u64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            side,
            order_type: OrderType::Market,
            time_in_force: TimeInForce::Day,
            limit_price: None,
        }
    }

    /// Day limit order at `limit_price`.
    pub fn limit(
        symbol: impl Into<String>,
        quantity: u64,
        side: OrderSide,
        limit_price: Decimal,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(symbol, quantity, side)
        }
    }
}

/// Order as acknowledged by the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: String,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub qty: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_short_position_quantity_is_absolute_and_floored() {
        let raw: RawPosition = serde_json::from_str(
            r#"{"symbol":"TSLA","qty":"-12.7","side":"short","market_value":"-2540.00"}"#,
        )
        .unwrap();
        let position = Position::from(raw);

        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.quantity, 12);
        assert_eq!(position.market_value, dec!(-2540.00));
    }

    #[test]
    fn test_market_order_serialization() {
        let order = OrderRequest::market("AAPL", 7, OrderSide::Sell);
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(json["symbol"], "AAPL");
        assert_eq!(json["qty"], 7);
        assert_eq!(json["side"], "sell");
        assert_eq!(json["type"], "market");
        assert_eq!(json["time_in_force"], "day");
        assert!(json.get("limit_price").is_none());
    }

    #[test]
    fn test_limit_order_serialization() {
        let order = OrderRequest::limit("MSFT", 3, OrderSide::Buy, dec!(412.35));
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(json["type"], "limit");
        assert_eq!(json["limit_price"], "412.35");
        assert_eq!(json["time_in_force"], "day");
    }

    #[test]
    fn test_closing_side() {
        assert_eq!(PositionSide::Long.closing_side(), OrderSide::Sell);
        assert_eq!(PositionSide::Short.closing_side(), OrderSide::Buy);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
    }
}
